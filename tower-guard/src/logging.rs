use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::interceptor::Interceptor;
use crate::interceptor::Request;
use crate::service::Next;
use crate::status::Status;

/// Renders a message for the log, or explains why it could not.
pub type Formatter<M> = Arc<dyn Fn(&M) -> Result<String, String> + Send + Sync>;

/// Renders an optional message: `"<nil>"` when absent, the formatter's failure otherwise.
pub fn marshal<M>(message: Option<&M>, formatter: &Formatter<M>) -> String {
    match message {
        None => "<nil>".to_owned(),
        Some(message) => match formatter(message) {
            Ok(text) => text,
            Err(err) => format!("Marshal to json error: {err}"),
        },
    }
}

/// Logs each call on the way in and on the way out.
pub struct Logging<T, U> {
    request: Formatter<T>,
    response: Formatter<U>,
}

impl<T, U> Clone for Logging<T, U> {
    fn clone(&self) -> Self {
        Self {
            request: Arc::clone(&self.request),
            response: Arc::clone(&self.response),
        }
    }
}

impl<T, U> fmt::Debug for Logging<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logging").finish_non_exhaustive()
    }
}

impl<T, U> Logging<T, U> {
    pub fn with_formatters(request: Formatter<T>, response: Formatter<U>) -> Self {
        Self { request, response }
    }
}

impl<T: fmt::Debug + 'static, U: fmt::Debug + 'static> Logging<T, U> {
    /// Messages rendered with their `Debug` output.
    pub fn debug() -> Self {
        Self::with_formatters(
            Arc::new(|m: &T| Ok(format!("{m:?}"))),
            Arc::new(|m: &U| Ok(format!("{m:?}"))),
        )
    }
}

impl<T: Serialize + 'static, U: Serialize + 'static> Logging<T, U> {
    /// Messages rendered as JSON.
    pub fn json() -> Self {
        Self::with_formatters(
            Arc::new(|m: &T| serde_json::to_string(m).map_err(|e| e.to_string())),
            Arc::new(|m: &U| serde_json::to_string(m).map_err(|e| e.to_string())),
        )
    }
}

impl<T, U> Interceptor<T, U> for Logging<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn intercept(
        self: Arc<Self>,
        request: Request<T>,
        next: Next<T, U>,
    ) -> BoxFuture<'static, Result<U, Status>> {
        Box::pin(async move {
            let method = request.info().method().to_owned();
            let start = Instant::now();
            info!(
                %method,
                request = %marshal(Some(request.message()), &self.request),
                "calling"
            );

            let response = next.run(request).await;

            let elapsed = start.elapsed();
            match &response {
                Ok(message) => info!(
                    %method,
                    ?elapsed,
                    response = %marshal(Some(message), &self.response),
                    "finished"
                ),
                Err(status) => info!(
                    %method,
                    ?elapsed,
                    response = %marshal(None, &self.response),
                    error = %status,
                    "finished"
                ),
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Greeting {
        name: String,
        count: u32,
    }

    #[test]
    fn json_rendering() {
        let logging = Logging::<Greeting, BTreeMap<Vec<u8>, u8>>::json();
        let greeting = Greeting {
            name: "ada".into(),
            count: 2,
        };
        assert_eq!(
            marshal(Some(&greeting), &logging.request),
            r#"{"name":"ada","count":2}"#
        );
        assert_eq!(marshal(None, &logging.request), "<nil>");

        let unkeyable = BTreeMap::from([(vec![1_u8], 1_u8)]);
        assert!(
            marshal(Some(&unkeyable), &logging.response).starts_with("Marshal to json error: ")
        );
    }

    #[test]
    fn debug_rendering() {
        let logging = Logging::<&str, Option<u8>>::debug();
        assert_eq!(marshal(Some(&"hi"), &logging.request), "\"hi\"");
        assert_eq!(marshal(Some(&None), &logging.response), "None");
    }
}
