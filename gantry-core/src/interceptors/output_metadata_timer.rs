use crate::{
    error::Failure,
    interceptor::{Interceptor, InterceptorClass, Next},
    request::{Reply, Request},
    timer,
};

#[derive(Debug, Clone)]
pub struct OutputMetadataTimerOptions {
    /// Outbound metadata key receiving the elapsed milliseconds.
    pub metadata_key: String,
}

impl Default for OutputMetadataTimerOptions {
    fn default() -> Self {
        Self {
            metadata_key: "timer".to_string(),
        }
    }
}

/// Reports how long the rest of the chain took in the outbound metadata.
pub struct OutputMetadataTimer {
    metadata_key: String,
}

impl InterceptorClass for OutputMetadataTimer {
    type Options = OutputMetadataTimerOptions;

    fn build(_request: &Request, options: &Self::Options) -> Self {
        Self {
            metadata_key: options.metadata_key.clone(),
        }
    }
}

#[tonic::async_trait]
impl Interceptor for OutputMetadataTimer {
    async fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Reply, Failure> {
        let timed = timer::time(next.run(request)).await;
        let elapsed = format!("{:.4}", timed.elapsed_ms());
        request
            .call_mut()
            .set_output_metadata(&self.metadata_key, &elapsed);
        timed.into_result()
    }
}
