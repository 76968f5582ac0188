mod payload;
mod record;
mod value;
mod watermark;

pub use payload::*;
pub use record::*;
pub use value::*;
pub use watermark::*;
