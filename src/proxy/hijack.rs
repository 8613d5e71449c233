use hyper::{
    upgrade::{OnUpgrade, Upgraded},
    Request,
};
use hyper_util::rt::TokioIo;

/// Exclusive claim on the client connection a request arrived on.
///
/// The claim is moved out of the request, so the HTTP layer cannot hand the
/// same connection over twice. Consuming it with [`Hijack::into_stream`]
/// yields the raw transport once the response head has been written.
pub struct Hijack {
    on_upgrade: OnUpgrade,
}

impl Hijack {
    /// Returns `None` when the connection serving `req` cannot release its
    /// transport, e.g. a request that did not come from an HTTP/1 server
    /// connection.
    pub fn take<B>(req: &mut Request<B>) -> Option<Self> {
        req.extensions_mut()
            .remove::<OnUpgrade>()
            .map(|on_upgrade| Self { on_upgrade })
    }

    pub async fn into_stream(self) -> Result<TokioIo<Upgraded>, hyper::Error> {
        Ok(TokioIo::new(self.on_upgrade.await?))
    }
}
