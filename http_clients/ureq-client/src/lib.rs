use anyhow::Result;
use async_trait::async_trait;
use sfucore::net::{HttpClient, HttpRequest, HttpResponse};

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
#[derive(Debug, Clone, Default)]
pub struct UreqHttpClient;

impl UreqHttpClient {
    pub fn new() -> Self {
        Self
    }
}

fn call(request: HttpRequest) -> Result<HttpResponse> {
    let response = match request.method.as_str() {
        "GET" => {
            let mut req = ureq::get(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            req.call()?
        }
        "POST" => {
            let mut req = ureq::post(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            req.send(request.body.as_deref().unwrap_or_default())?
        }
        method => {
            return Err(anyhow::anyhow!("Unsupported HTTP method: {method}"));
        }
    };

    let status_code = response.status().as_u16();
    let body = response.into_body().read_to_vec()?;
    Ok(HttpResponse::from_bytes(status_code, body))
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        tokio::task::spawn_blocking(move || call(request)).await?
    }
}
