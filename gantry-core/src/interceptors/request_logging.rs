use super::lists_method;
use crate::{
    error::Failure,
    interceptor::{Interceptor, InterceptorClass, Next},
    request::{Reply, Request},
    timer,
};
use serde_json::Value;
use tonic::Code;
use tracing::{Level, debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct RequestLoggingOptions {
    /// Include the request message in the log event.
    pub log_parameters: bool,
    /// Dotted paths of request fields replaced by `redacted_string` before logging.
    pub blocklist: Vec<String>,
    pub redacted_string: String,
    /// Methods that are never logged.
    pub ignore_methods: Vec<String>,
    pub success_level: Level,
    pub failure_level: Level,
}

impl Default for RequestLoggingOptions {
    fn default() -> Self {
        Self {
            log_parameters: false,
            blocklist: Vec::new(),
            redacted_string: "REDACTED".to_string(),
            ignore_methods: Vec::new(),
            success_level: Level::INFO,
            failure_level: Level::ERROR,
        }
    }
}

/// Logs one event per call with its outcome and duration.
pub struct RequestLogging {
    options: RequestLoggingOptions,
}

impl InterceptorClass for RequestLogging {
    type Options = RequestLoggingOptions;

    fn build(_request: &Request, options: &Self::Options) -> Self {
        Self {
            options: options.clone(),
        }
    }
}

#[tonic::async_trait]
impl Interceptor for RequestLogging {
    async fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Reply, Failure> {
        if lists_method(&self.options.ignore_methods, request) {
            return next.run(request).await;
        }

        let method = request.method_name();
        let params = self
            .options
            .log_parameters
            .then(|| request.message().map(|message| self.redact(message)))
            .flatten();

        let timed = timer::time(next.run(request)).await;
        let elapsed_ms = timed.elapsed_ms();
        let outcome = timed.into_result();

        let (code, app_code, level) = match &outcome {
            Ok(_) => (Code::Ok, None, self.options.success_level),
            Err(Failure::Status(status)) => (
                status.code(),
                Some(request.error().app_code()),
                self.options.failure_level,
            ),
            Err(Failure::Unexpected(_)) => (Code::Internal, None, self.options.failure_level),
        };

        macro_rules! log {
            ($macro:ident) => {
                $macro!(
                    method = %method,
                    code = ?code,
                    app_code,
                    elapsed_ms,
                    params = params.as_deref(),
                    "[{:?}] ({}) [{:.2}ms]",
                    code,
                    method,
                    elapsed_ms
                )
            };
        }

        if level == Level::ERROR {
            log!(error);
        } else if level == Level::WARN {
            log!(warn);
        } else if level == Level::INFO {
            log!(info);
        } else if level == Level::DEBUG {
            log!(debug);
        } else {
            log!(trace);
        }

        outcome
    }
}

impl RequestLogging {
    fn redact(&self, message: &Value) -> String {
        let mut params = message.clone();
        for path in &self.options.blocklist {
            let path: Vec<&str> = path.split('.').collect();
            redact(&mut params, &path, &self.options.redacted_string);
        }
        params.to_string()
    }
}

fn redact(value: &mut Value, path: &[&str], redacted: &str) {
    match value {
        Value::Array(items) => {
            for item in items {
                redact(item, path, redacted);
            }
        }
        Value::Object(fields) => match path {
            [] => {}
            [leaf] => {
                if let Some(field) = fields.get_mut(*leaf) {
                    *field = Value::String(redacted.to_string());
                }
            }
            [head, rest @ ..] => {
                if let Some(field) = fields.get_mut(*head) {
                    redact(field, rest, redacted);
                }
            }
        },
        _ => {}
    }
}
