use std::fmt::Debug;

use error_stack::{report, Result};
use ethers_providers::{Http, JsonRpcClient, ProviderError, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Error;
use crate::url::Url;

/// JSON-RPC client that classifies provider failures into [`Error`].
#[derive(Debug)]
pub struct Client<P>
where
    P: JsonRpcClient,
{
    provider: P,
}

impl<P> Client<P>
where
    P: JsonRpcClient,
{
    pub fn new(provider: P) -> Self {
        Client { provider }
    }

    pub async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Error>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        self.provider
            .request(method, params)
            .await
            .map_err(Into::<ProviderError>::into)
            .map_err(|err| {
                report!(classify(&err))
                    .attach_printable(format!("method: {method}"))
                    .attach_printable(err.to_string())
            })
    }

    #[cfg(test)]
    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl Client<Http> {
    pub fn new_http(url: &Url) -> Self {
        Client::new(Http::new(url.to_standard_url()))
    }
}

fn classify(err: &ProviderError) -> Error {
    match err.as_error_response() {
        Some(response) if is_nonce_message(&response.message) => Error::NonceContention,
        Some(_) => Error::Rejected,
        None if err.as_serde_error().is_some() => Error::InvalidResponse,
        None => Error::Network,
    }
}

fn is_nonce_message(message: &str) -> bool {
    let message = message.to_lowercase();

    message.contains("nonce")
        || message.contains("already known")
        || message.contains("replacement transaction underpriced")
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::collections::{HashMap, VecDeque};
    use std::fmt::Debug;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ethers_providers::{JsonRpcClient, JsonRpcError, ProviderError, RpcError};
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use serde_json::Value;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("{0}")]
    pub struct NodeError(pub JsonRpcError);

    impl RpcError for NodeError {
        fn as_error_response(&self) -> Option<&JsonRpcError> {
            Some(&self.0)
        }

        fn as_serde_error(&self) -> Option<&serde_json::Error> {
            None
        }
    }

    pub fn node_error(message: &str) -> ProviderError {
        ProviderError::JsonRpcClientError(Box::new(NodeError(JsonRpcError {
            code: -32000,
            message: message.to_string(),
            data: None,
        })))
    }

    /// Provider answering each method with queued responses in order and recording every request.
    #[derive(Debug, Default)]
    pub struct FakeProvider {
        responses: Mutex<HashMap<String, VecDeque<Result<Value, ProviderError>>>>,
        pub requests: Mutex<Vec<(String, Value)>>,
    }

    impl FakeProvider {
        pub fn respond(self, method: &str, response: Result<Value, ProviderError>) -> Self {
            self.responses
                .lock()
                .unwrap()
                .entry(method.to_string())
                .or_default()
                .push_back(response);
            self
        }

        pub fn requests_of(&self, method: &str) -> Vec<Value> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(requested, _)| requested == method)
                .map(|(_, params)| params.clone())
                .collect()
        }
    }

    #[async_trait]
    impl JsonRpcClient for FakeProvider {
        type Error = ProviderError;

        async fn request<T, R>(&self, method: &str, params: T) -> Result<R, ProviderError>
        where
            T: Debug + Serialize + Send + Sync,
            R: DeserializeOwned + Send,
        {
            self.requests
                .lock()
                .unwrap()
                .push((method.to_string(), serde_json::to_value(params)?));

            let response = self
                .responses
                .lock()
                .unwrap()
                .get_mut(method)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| panic!("unexpected request {method}"))?;

            Ok(serde_json::from_value(response)?)
        }
    }
}
