use anyhow::Result;
use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

use crate::error::SupabaseApiError;

/// Thin PostgREST client. Every row-level operation the cells need is
/// expressed as a filtered REST call or an RPC into a SQL function.
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    service_role_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
            service_role_key: config.supabase_service_role_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let api_key = if self.anon_key.is_empty() {
            &self.service_role_key
        } else {
            &self.anon_key
        };
        headers.insert("apikey", HeaderValue::from_str(api_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }

        Ok(headers)
    }

    pub async fn request<T>(&self, method: Method, path: &str,
                            auth_token: Option<&str>, body: Option<Value>)
                            -> Result<T>
    where T: DeserializeOwned {
        self.request_with_headers(method, path, auth_token, body, None).await
    }

    pub async fn request_with_headers<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<T>
    where T: DeserializeOwned {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let mut headers = self.get_headers(auth_token)?;
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url)
            .headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(SupabaseApiError {
                status: status.as_u16(),
                message: error_text,
            }.into());
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    /// Write that asks PostgREST to echo the affected rows back. An empty
    /// vector means the filter matched nothing.
    pub async fn request_returning<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Value,
    ) -> Result<Vec<T>>
    where T: DeserializeOwned {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        self.request_with_headers(method, path, auth_token, Some(body), Some(headers)).await
    }

    /// Calls a SQL function through `/rest/v1/rpc`. Each call runs in a
    /// single database transaction.
    pub async fn rpc<T>(&self, function: &str, auth_token: Option<&str>, args: Value) -> Result<T>
    where T: DeserializeOwned {
        let path = format!("/rest/v1/rpc/{}", function);
        self.request(Method::POST, &path, auth_token, Some(args)).await
    }

    /// Token used by backend-owned writes (webhooks, paired inserts) that do
    /// not run on behalf of an end user.
    pub fn service_token(&self) -> &str {
        &self.service_role_key
    }
}
