use procache::CropRect;

use crate::error::AppError;

/// Parse `WIDTHxHEIGHT`, e.g. `300x200`.
pub fn parse_dimensions(s: &str) -> Result<(u32, u32), AppError> {
    let (w, h) = s
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| AppError::ParseError(format!("expected WIDTHxHEIGHT, got '{s}'")))?;
    Ok((parse_u32(w)?, parse_u32(h)?))
}

/// Parse `x,y,width,height`.
pub fn parse_crop(s: &str) -> Result<CropRect, AppError> {
    let parts = s
        .split(',')
        .map(parse_u32)
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(CropRect::new(*x, *y, *w, *h)),
        _ => Err(AppError::ParseError(format!(
            "expected x,y,width,height, got '{s}'"
        ))),
    }
}

fn parse_u32(s: &str) -> Result<u32, AppError> {
    s.trim()
        .parse()
        .map_err(|_| AppError::ParseError(format!("invalid number '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_dimensions("300x200").unwrap(), (300, 200));
        assert_eq!(parse_dimensions("64X64").unwrap(), (64, 64));
        assert!(parse_dimensions("300").is_err());
        assert!(parse_dimensions("ax2").is_err());
    }

    #[test]
    fn test_parse_crop() {
        assert_eq!(parse_crop("1, 2,30,40").unwrap(), CropRect::new(1, 2, 30, 40));
        assert!(parse_crop("1,2,3").is_err());
    }
}
