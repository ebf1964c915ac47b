use std::future::Future;

use serde::de::DeserializeOwned;

/// A typed job handler.
///
/// Implementations declare the unique name they answer to and the payload
/// shape they expect; the stored payload map is decoded into `Data` before
/// [`execute`](Self::execute) runs.
///
/// ```
/// use rota::JobHandler;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Subscribe {
///     channel: String,
/// }
///
/// struct SubscribeHandler;
///
/// impl JobHandler for SubscribeHandler {
///     const NAME: &'static str = "subscribe-to-channel";
///     type Data = Subscribe;
///
///     async fn execute(&self, data: Option<Subscribe>) -> anyhow::Result<()> {
///         let data = data.ok_or_else(|| anyhow::anyhow!("missing payload"))?;
///         println!("subscribing to {}", data.channel);
///         Ok(())
///     }
/// }
/// ```
pub trait JobHandler: Send + Sync + 'static {
    /// Unique handler name. This MUST be unique within a registry.
    const NAME: &'static str;

    /// The payload shape this handler expects.
    type Data: DeserializeOwned + Send + 'static;

    /// Run one job. A returned error (or a panic) counts as a failed
    /// attempt and is retried per the scheduler's retry policy.
    fn execute(&self, data: Option<Self::Data>) -> impl Future<Output = anyhow::Result<()>> + Send;
}
