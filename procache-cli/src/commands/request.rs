use procache::{
    LoadRequest, OutputFormat, Resize, ResizeMode, SourceIdentity, TransformOptions,
};

use crate::cli::RequestArgs;
use crate::error::AppError;
use crate::utils::{parse_crop, parse_dimensions};

/// Turn command line request options into a [`LoadRequest`].
pub fn build_request(args: &RequestArgs) -> Result<LoadRequest, AppError> {
    let source = if args.content {
        SourceIdentity::content(&args.source)
    } else {
        SourceIdentity::uri(&args.source)
    };

    let format: OutputFormat = args.format.parse().map_err(AppError::InvalidInput)?;
    let mut options = TransformOptions::new()
        .with_rotation(args.rotate)
        .with_format(format)
        .with_low_quality(args.low_quality)
        .with_thumbnail_mode(args.thumbnail)
        .with_orientation_correction_disabled(args.no_orient);

    if let Some(max) = &args.max {
        let (w, h) = parse_dimensions(max)?;
        options = options.with_max_size(w, h);
    }
    if let Some(resize) = &args.resize {
        let (w, h) = parse_dimensions(resize)?;
        let mode = if args.exact {
            ResizeMode::Exact
        } else {
            ResizeMode::AspectFit
        };
        options = options.with_resize(Resize::new(w, h).with_mode(mode));
    }
    if let Some(crop) = &args.crop {
        options = options.with_crop(parse_crop(crop)?);
    }
    if let Some(quality) = args.quality {
        options = options.with_quality(quality);
    }
    if let Some(processor) = &args.processor {
        options = options.with_processor(processor);
    }

    Ok(LoadRequest::new(source, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use procache::FingerprintKeyer;

    use crate::cli::{CliArgs, Command};

    fn request_args(args: &[&str]) -> RequestArgs {
        let mut argv = vec!["procache", "key"];
        argv.extend_from_slice(args);
        match CliArgs::parse_from(argv).command {
            Command::Key { request } => request,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_options_from_flags() {
        let args = request_args(&[
            "--source", "abc", "--content", "--resize", "10x20", "--exact", "--rotate", "-90",
            "--format", "png", "--quality", "80",
        ]);
        let request = build_request(&args).unwrap();

        assert_eq!(request.source, SourceIdentity::content("abc"));
        assert_eq!(
            request.options.resize,
            Some(Resize::new(10, 20).with_mode(ResizeMode::Exact))
        );
        assert_eq!(request.options.normalized_rotation(), 270);
        assert_eq!(request.options.format, OutputFormat::Png);
        assert_eq!(request.options.quality, Some(80));
    }

    #[test]
    fn test_same_flags_same_key() {
        let keyer = FingerprintKeyer::new();
        let a = build_request(&request_args(&["--source", "s", "--max", "5x5"])).unwrap();
        let b = build_request(&request_args(&["--max", "5x5", "--source", "s"])).unwrap();
        assert_eq!(
            keyer.compute_key(&a.source, &a.options),
            keyer.compute_key(&b.source, &b.options)
        );
    }

    #[test]
    fn test_bad_format_rejected() {
        let args = request_args(&["--source", "s", "--format", "tiff"]);
        assert!(matches!(
            build_request(&args),
            Err(AppError::InvalidInput(_))
        ));
    }
}
