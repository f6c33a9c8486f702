//! Provider settings derived from the server environment.
//!
//! Every remote backend is configured through `*_API_KEY` / `*_BASE_URL` /
//! `*_TIMEOUT_MS` variables. A provider with no credential present is simply
//! not composed into the registry. Docker needs no credential; it talks to
//! the local daemon.

use std::time::Duration;

/// Settings for providers speaking plain bearer-token REST.
#[derive(Debug, Clone)]
pub struct RestSettings {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ModalSettings {
    pub token_id: String,
    pub token_secret: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BlaxelSettings {
    pub api_key: String,
    pub workspace: String,
    pub base_url: String,
    /// Base for per-sandbox runtime endpoints.
    pub run_base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CloudflareSettings {
    pub api_token: String,
    pub account_id: String,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct VercelSettings {
    /// Either a personal access token or an OIDC token; access token wins.
    pub token: String,
    pub team_id: Option<String>,
    pub project_id: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DockerSettings {
    /// Host advertised in synthesized port URLs.
    pub advertise_host: String,
    pub default_image: String,
    pub timeout: Duration,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            advertise_host: "127.0.0.1".to_string(),
            default_image: "ubuntu:24.04".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// All provider settings resolved from the environment.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub modal: Option<ModalSettings>,
    pub e2b: Option<RestSettings>,
    pub daytona: Option<RestSettings>,
    pub blaxel: Option<BlaxelSettings>,
    pub cloudflare: Option<CloudflareSettings>,
    pub vercel: Option<VercelSettings>,
    pub docker: Option<DockerSettings>,
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Resolve settings from an arbitrary lookup. Empty values count as
    /// absent.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let timeout = |key: &str, default_secs: u64| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_secs(default_secs))
        };

        let modal = match (get("MODAL_TOKEN_ID"), get("MODAL_TOKEN_SECRET")) {
            (Some(token_id), Some(token_secret)) => Some(ModalSettings {
                token_id,
                token_secret,
                timeout: timeout("MODAL_TIMEOUT_MS", 600),
            }),
            _ => None,
        };

        let e2b = get("E2B_API_KEY").map(|api_key| RestSettings {
            api_key,
            base_url: get("E2B_BASE_URL").unwrap_or_else(|| "https://api.e2b.dev".into()),
            timeout: timeout("E2B_TIMEOUT_MS", 60),
        });

        let daytona = get("DAYTONA_API_KEY").map(|api_key| RestSettings {
            api_key,
            base_url: get("DAYTONA_BASE_URL")
                .unwrap_or_else(|| "https://app.daytona.io/api".into()),
            timeout: timeout("DAYTONA_TIMEOUT_MS", 120),
        });

        let blaxel = match (get("BLAXEL_API_KEY"), get("BLAXEL_WORKSPACE")) {
            (Some(api_key), Some(workspace)) => Some(BlaxelSettings {
                api_key,
                workspace,
                base_url: get("BLAXEL_BASE_URL")
                    .unwrap_or_else(|| "https://api.blaxel.ai/v0".into()),
                run_base_url: get("BLAXEL_RUN_BASE_URL")
                    .unwrap_or_else(|| "https://run.blaxel.ai".into()),
                timeout: timeout("BLAXEL_TIMEOUT_MS", 60),
            }),
            _ => None,
        };

        let cloudflare = match (get("CLOUDFLARE_API_TOKEN"), get("CLOUDFLARE_ACCOUNT_ID")) {
            (Some(api_token), Some(account_id)) => Some(CloudflareSettings {
                api_token,
                account_id,
                base_url: get("CLOUDFLARE_BASE_URL")
                    .unwrap_or_else(|| "https://api.cloudflare.com/client/v4".into()),
                timeout: timeout("CLOUDFLARE_TIMEOUT_MS", 60),
            }),
            _ => None,
        };

        let vercel = get("VERCEL_ACCESS_TOKEN")
            .or_else(|| get("VERCEL_OIDC_TOKEN"))
            .map(|token| VercelSettings {
                token,
                team_id: get("VERCEL_TEAM_ID"),
                project_id: get("VERCEL_PROJECT_ID"),
                base_url: get("VERCEL_BASE_URL")
                    .unwrap_or_else(|| "https://api.vercel.com".into()),
                timeout: timeout("VERCEL_TIMEOUT_MS", 60),
            });

        // Docker is opt-out: present unless explicitly disabled.
        let docker = match get("DOCKER_DISABLED").as_deref() {
            Some("1") | Some("true") => None,
            _ => Some(DockerSettings {
                advertise_host: get("ADVERTISE_HOST").unwrap_or_else(|| "127.0.0.1".into()),
                default_image: get("DOCKER_DEFAULT_IMAGE")
                    .unwrap_or_else(|| "ubuntu:24.04".into()),
                timeout: timeout("DOCKER_TIMEOUT_MS", 120),
            }),
        };

        Self {
            modal,
            e2b,
            daytona,
            blaxel,
            cloudflare,
            vercel,
            docker,
        }
    }

    /// Providers that have everything they need to be composed.
    pub fn configured_providers(&self) -> Vec<crate::types::Provider> {
        use crate::types::Provider;
        let mut out = Vec::new();
        if self.modal.is_some() {
            out.push(Provider::Modal);
        }
        if self.e2b.is_some() {
            out.push(Provider::E2b);
        }
        if self.daytona.is_some() {
            out.push(Provider::Daytona);
        }
        if self.blaxel.is_some() {
            out.push(Provider::Blaxel);
        }
        if self.cloudflare.is_some() {
            out.push(Provider::Cloudflare);
        }
        if self.vercel.is_some() {
            out.push(Provider::Vercel);
        }
        if self.docker.is_some() {
            out.push(Provider::Docker);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;
    use std::collections::BTreeMap;

    fn lookup<'a>(map: &'a BTreeMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key: &str| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn empty_env_leaves_only_docker() {
        let map = BTreeMap::new();
        let settings = Settings::from_lookup(&lookup(&map));
        assert_eq!(settings.configured_providers(), vec![Provider::Docker]);
        let docker = settings.docker.unwrap();
        assert_eq!(docker.advertise_host, "127.0.0.1");
    }

    #[test]
    fn modal_requires_both_tokens() {
        let mut map = BTreeMap::new();
        map.insert("MODAL_TOKEN_ID", "ak-1");
        let settings = Settings::from_lookup(&lookup(&map));
        assert!(settings.modal.is_none());

        map.insert("MODAL_TOKEN_SECRET", "as-1");
        let settings = Settings::from_lookup(&lookup(&map));
        assert!(settings.modal.is_some());
    }

    #[test]
    fn base_url_and_timeout_overrides() {
        let mut map = BTreeMap::new();
        map.insert("DAYTONA_API_KEY", "dtn_key");
        map.insert("DAYTONA_BASE_URL", "http://127.0.0.1:3986/api");
        map.insert("DAYTONA_TIMEOUT_MS", "5000");
        let settings = Settings::from_lookup(&lookup(&map));
        let daytona = settings.daytona.unwrap();
        assert_eq!(daytona.base_url, "http://127.0.0.1:3986/api");
        assert_eq!(daytona.timeout, Duration::from_millis(5000));
    }

    #[test]
    fn vercel_access_token_wins_over_oidc() {
        let mut map = BTreeMap::new();
        map.insert("VERCEL_ACCESS_TOKEN", "tok-a");
        map.insert("VERCEL_OIDC_TOKEN", "tok-b");
        let settings = Settings::from_lookup(&lookup(&map));
        assert_eq!(settings.vercel.unwrap().token, "tok-a");
    }

    #[test]
    fn docker_can_be_disabled() {
        let mut map = BTreeMap::new();
        map.insert("DOCKER_DISABLED", "1");
        let settings = Settings::from_lookup(&lookup(&map));
        assert!(settings.docker.is_none());
        assert!(settings.configured_providers().is_empty());
    }
}
