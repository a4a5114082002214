mod report;
mod status;

pub use report::{format_batch_report, format_cache_list, format_publish_report, format_size};
pub use status::{format_age, format_status};
