use crate::{
    config::Settings,
    item::Item,
    store::{MetadataSource, SourceError},
};
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("modorder/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads item records from a metadata service that serves one JSON document per item.
pub struct HttpSource {
    agent: ureq::Agent,
    endpoint: String,
    game: String,
}

impl HttpSource {
    pub fn new(settings: &Settings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT.min(settings.request_timeout()))
            .timeout_read(settings.request_timeout())
            .timeout_write(settings.request_timeout())
            .build();
        Self {
            agent,
            endpoint: settings.metadata_endpoint.trim_end_matches('/').to_string(),
            game: settings.game_name.clone(),
        }
    }

    pub fn item_url(&self, id: &str) -> String {
        format!("{}/{}/mods/{id}.json", self.endpoint, self.game)
    }
}

impl MetadataSource for HttpSource {
    fn fetch(&self, id: &str) -> Result<Item, SourceError> {
        let url = self.item_url(id);
        debug!("GET {url}");
        let response = match self.agent.get(&url).set("User-Agent", USER_AGENT).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code @ (404 | 410), response)) => {
                let reason = response
                    .into_string()
                    .ok()
                    .map(|body| body.trim().to_string())
                    .filter(|body| !body.is_empty() && body.len() < 200)
                    .unwrap_or_else(|| format!("HTTP {code}"));
                return Err(SourceError::Unavailable {
                    id: id.to_string(),
                    reason,
                });
            }
            Err(ureq::Error::Status(code, _)) => {
                return Err(SourceError::Transport {
                    id: id.to_string(),
                    message: format!("HTTP {code}"),
                });
            }
            Err(err) => {
                return Err(SourceError::Transport {
                    id: id.to_string(),
                    message: err.to_string(),
                });
            }
        };
        response
            .into_json::<Item>()
            .map_err(|err| SourceError::Decode {
                id: id.to_string(),
                message: err.to_string(),
            })
    }
}
