pub mod google;
pub mod indexnow;
pub mod scanner;

pub use google::GoogleSubmitHandler;
pub use indexnow::IndexNowSubmitHandler;
pub use scanner::ScannerHandler;
