//! Category → subscriber URL registry.

use std::net::IpAddr;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use url::Url;

use updaterelay_shared::Category;

/// Ordered, duplicate-free subscriber lists keyed by category.
#[derive(Debug, Default)]
pub struct WebhookRegistry {
    subscriptions: DashMap<Category, Vec<Url>>,
    /// Accept loopback/private targets (local receivers, mock servers).
    allow_private_targets: bool,
}

impl WebhookRegistry {
    pub fn new(allow_private_targets: bool) -> Self {
        Self {
            subscriptions: DashMap::new(),
            allow_private_targets,
        }
    }

    /// Subscribe `url` to `category`. Returns `true` only if it was added.
    pub fn register(&self, category: Category, url: &str) -> bool {
        let url = match Url::parse(url) {
            Ok(url) => url,
            Err(e) => {
                warn!(%category, url, error = %e, "rejected webhook: invalid URL");
                return false;
            }
        };

        if !self.allow_private_targets && is_ssrf_target(&url) {
            warn!(%category, %url, "rejected webhook: non-http or private target");
            return false;
        }
        if !matches!(url.scheme(), "http" | "https") {
            warn!(%category, %url, "rejected webhook: unsupported scheme");
            return false;
        }

        let mut urls = self.subscriptions.entry(category).or_default();
        if urls.contains(&url) {
            debug!(%category, %url, "webhook already registered");
            return false;
        }
        info!(%category, %url, "registered webhook");
        urls.push(url);
        true
    }

    /// Remove `url` from `category`. Returns `true` only if it was present.
    pub fn unregister(&self, category: Category, url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        let Some(mut urls) = self.subscriptions.get_mut(&category) else {
            return false;
        };

        let before = urls.len();
        urls.retain(|existing| existing != &url);
        let removed = urls.len() != before;
        if removed {
            info!(%category, %url, "unregistered webhook");
        }
        removed
    }

    /// Subscribers for `category`, in registration order.
    pub fn subscribers(&self, category: Category) -> Vec<Url> {
        self.subscriptions
            .get(&category)
            .map(|urls| urls.clone())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, category: Category, url: &Url) -> bool {
        self.subscriptions
            .get(&category)
            .is_some_and(|urls| urls.contains(url))
    }

    /// Every `(category, url)` pair, grouped by category.
    pub fn subscriptions(&self) -> Vec<(Category, Url)> {
        Category::ALL
            .iter()
            .flat_map(|&category| {
                self.subscribers(category)
                    .into_iter()
                    .map(move |url| (category, url))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a private/internal network address.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (a == 100 && (b & 0xC0) == 64)
                // 192.0.0.0/24
                || (a == 192 && b == 0 && c == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
