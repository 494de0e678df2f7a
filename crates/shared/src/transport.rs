use anyhow::{Context as _, Result};
use url::Url;

pub type Web3 = web3::Web3<web3::transports::Http>;

/// Creates the standard HTTP transport used by all services.
pub fn create_transport(url: &Url) -> Result<Web3> {
    let transport = web3::transports::Http::new(url.as_str())
        .with_context(|| format!("failed to create transport for {url}"))?;
    Ok(web3::Web3::new(transport))
}

/// Like above but takes the url from the environment NODE_URL.
pub fn create_env_test_transport() -> Web3 {
    let env = std::env::var("NODE_URL").unwrap();
    let transport = web3::transports::Http::new(&env).unwrap();
    web3::Web3::new(transport)
}
