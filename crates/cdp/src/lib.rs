pub mod chrome;
pub mod client;
pub mod driver;
pub mod elements;

pub use chrome::{ChromeEndpoint, TabTarget};
pub use client::CdpClient;
pub use driver::{AttachmentRegistry, PageState, TabDriver};
