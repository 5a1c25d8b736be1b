//! Boundary traits towards the surrounding service engine.
//!
//! The bridge never decodes requests itself. Decoding, dispatch and encoding
//! happen behind [`CallbackService`]; the bridge only moves bytes between the
//! broker and that engine. [`ResponseObserver`] is a fire-and-forget hook
//! used for auditing computed responses.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;

use crate::{
    error::{BridgeError, ServiceError},
    format::Format,
    panic::format_panic,
};

/// The engine that turns decoded requests into responses.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use bytes::Bytes;
/// use queuebridge::{error::ServiceError, format::Format, service::CallbackService};
///
/// struct Echo;
///
/// #[async_trait]
/// impl CallbackService for Echo {
///     async fn process_one(&self, request: Bytes) -> Result<Bytes, ServiceError> { Ok(request) }
///
///     async fn process_merged(
///         &self,
///         requests: Vec<Bytes>,
///         _format: Format,
///     ) -> Result<Bytes, ServiceError> {
///         Ok(Bytes::from(requests.concat()))
///     }
/// }
/// ```
#[async_trait]
pub trait CallbackService: Send + Sync + 'static {
    /// Decode, dispatch and encode a single request.
    async fn process_one(&self, request: Bytes) -> Result<Bytes, ServiceError>;

    /// Decode, dispatch and encode a homogeneous batch as one orchestration
    /// unit, returning one merged response.
    async fn process_merged(
        &self,
        requests: Vec<Bytes>,
        format: Format,
    ) -> Result<Bytes, ServiceError>;

    /// Report engine health.
    fn is_healthy(&self) -> bool { true }

    /// Release engine resources. Called once when the owning endpoint is
    /// destroyed.
    async fn destroy(&self) {}
}

/// Fire-and-forget observer of computed responses.
pub trait ResponseObserver: Send + Sync + 'static {
    /// Observe a response alongside a representative request body.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the bridge logs the failure and carries on.
    fn on_response(&self, request: &Bytes, response: &Bytes) -> Result<(), ServiceError>;
}

impl<F> ResponseObserver for F
where
    F: Fn(&Bytes, &Bytes) -> Result<(), ServiceError> + Send + Sync + 'static,
{
    fn on_response(&self, request: &Bytes, response: &Bytes) -> Result<(), ServiceError> {
        self(request, response)
    }
}

/// The callback engine together with the optional response observer.
#[derive(Clone)]
pub struct Callbacks {
    /// Engine computing responses.
    pub service: Arc<dyn CallbackService>,
    /// Observer notified of every computed response.
    pub observer: Option<Arc<dyn ResponseObserver>>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Callbacks {
    /// Callbacks without an observer.
    #[must_use]
    pub fn new(service: Arc<dyn CallbackService>) -> Self {
        Self {
            service,
            observer: None,
        }
    }

    /// Attach a response observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ResponseObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub(crate) fn observe(&self, request: &Bytes, response: &Bytes) {
        notify_observer(self.observer.as_ref(), request, response);
    }
}

/// Invoke [`CallbackService::process_one`], folding panics into errors.
pub(crate) async fn dispatch_one(
    service: &Arc<dyn CallbackService>,
    request: Bytes,
) -> Result<Bytes, BridgeError> {
    guarded(service.process_one(request)).await
}

/// Invoke [`CallbackService::process_merged`], folding panics into errors.
pub(crate) async fn dispatch_merged(
    service: &Arc<dyn CallbackService>,
    requests: Vec<Bytes>,
    format: Format,
) -> Result<Bytes, BridgeError> {
    guarded(service.process_merged(requests, format)).await
}

async fn guarded<F>(call: F) -> Result<Bytes, BridgeError>
where
    F: Future<Output = Result<Bytes, ServiceError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result.map_err(BridgeError::Processing),
        Err(panic) => Err(BridgeError::Processing(
            format!("callback engine panicked: {}", format_panic(panic)).into(),
        )),
    }
}

/// Run the observer, logging rather than propagating any failure or panic.
pub(crate) fn notify_observer(
    observer: Option<&Arc<dyn ResponseObserver>>,
    request: &Bytes,
    response: &Bytes,
) {
    let Some(observer) = observer else { return };
    match std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_response(request, response))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::warn!(%error, "response observer failed"),
        Err(panic) => tracing::warn!(panic = %format_panic(panic), "response observer panicked"),
    }
}
