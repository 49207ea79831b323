mod size;
mod transform;

pub use self::size::{format_bytes, parse_size};
pub use self::transform::{parse_crop, parse_dimensions};
