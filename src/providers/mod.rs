pub mod browser;
pub mod mastercard;
pub mod util;

pub use browser::{BrowserSettings, ChromiumAcquirer};
pub use mastercard::MastercardSource;
