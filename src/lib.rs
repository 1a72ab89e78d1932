pub mod detect;
pub mod error;
pub mod features;
pub mod lag;
pub mod output;
pub mod rolling;
pub mod service_day;
pub mod stats;
pub mod testkit;
pub mod topology;
