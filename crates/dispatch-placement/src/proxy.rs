//! URLs for reaching a build host's agent through the network proxy.

use std::sync::Arc;

use dispatch_state::HostRegistry;
use url::form_urlencoded;

use crate::error::{DispatchError, DispatchResult};

#[derive(Clone)]
pub struct ProxyUrlBuilder {
    registry: Arc<dyn HostRegistry>,
    idc_proxy: String,
}

impl ProxyUrlBuilder {
    pub fn new(registry: Arc<dyn HostRegistry>, idc_proxy: impl Into<String>) -> Self {
        Self {
            registry,
            idc_proxy: idc_proxy.into(),
        }
    }

    /// Proxy URL for `uri` on the host at `ip`. Without an explicit port the
    /// host's registered port is used.
    pub async fn proxy_url(
        &self,
        uri: &str,
        ip: &str,
        port: Option<u16>,
    ) -> DispatchResult<String> {
        let port = match port {
            Some(port) => port,
            None => {
                self.registry
                    .get_by_ip(ip)
                    .await?
                    .ok_or_else(|| DispatchError::HostNotFound(ip.to_string()))?
                    .port
            }
        };
        let target = format!("http://{ip}:{port}{uri}");
        let encoded: String = form_urlencoded::byte_serialize(target.as_bytes()).collect();
        Ok(format!("{}/proxy-devnet?url={encoded}", self.idc_proxy.trim_end_matches('/')))
    }
}
