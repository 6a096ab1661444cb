//! Request/response models the pipeline hands to endpoints.

mod request;
mod response;

pub use request::{ContentDecoder, RequestModel};
pub use response::{ResponseBody, ResponseModel, ResponseProgress};
