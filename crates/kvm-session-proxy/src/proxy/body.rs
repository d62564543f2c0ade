//! Body type used for every response the proxy hands back to hyper.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use bytes::Bytes;
use hyper::Response;
use std::convert::Infallible;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Box the body of a response built locally.
pub trait ResponseExt {
    fn into_boxed(self) -> Response<ProxyBody>;
}

impl ResponseExt for Response<Full<Bytes>> {
    fn into_boxed(self) -> Response<ProxyBody> {
        self.map(|b| b.map_err(|never: Infallible| match never {}).boxed())
    }
}

impl ResponseExt for Response<hyper::body::Incoming> {
    fn into_boxed(self) -> Response<ProxyBody> {
        self.map(BodyExt::boxed)
    }
}
