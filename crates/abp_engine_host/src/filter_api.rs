//! Typed access to the filter engine implemented by the script bundle.
//!
//! Every method is one call on the bundle's global `API` object. Callers never
//! dispatch by function name themselves.

use std::sync::Arc;

use abp_config::Config;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    deferred::HostScheduler,
    error::{ApiError, InitError},
    host::{HostOptions, ScriptRuntimeHost},
};

/// Request content types, values are bit flags understood by the bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Other,
    Script,
    Image,
    Stylesheet,
    Object,
    Subdocument,
    Websocket,
    Webrtc,
    Ping,
    XmlHttpRequest,
    Media,
    Font,
    Document,
    GenericBlock,
    Elemhide,
    GenericHide,
}

impl ContentType {
    pub const fn bits(self) -> u32 {
        match self {
            ContentType::Other => 1,
            ContentType::Script => 2,
            ContentType::Image => 4,
            ContentType::Stylesheet => 8,
            ContentType::Object => 16,
            ContentType::Subdocument => 32,
            ContentType::Websocket => 128,
            ContentType::Webrtc => 256,
            ContentType::Ping => 1024,
            ContentType::XmlHttpRequest => 2048,
            ContentType::Media => 16384,
            ContentType::Font => 32768,
            ContentType::Document => 1 << 26,
            ContentType::GenericBlock => 1 << 27,
            ContentType::Elemhide => 1 << 28,
            ContentType::GenericHide => 1 << 29,
        }
    }

    pub fn mask(types: &[ContentType]) -> u32 {
        types.iter().fold(0, |mask, t| mask | t.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchesResult {
    Blocked,
    Allowlisted,
    NotFound,
}

impl MatchesResult {
    fn from_script(value: &Value) -> Self {
        match value.as_str() {
            Some("blocking") => MatchesResult::Blocked,
            Some("allowing") => MatchesResult::Allowlisted,
            _ => MatchesResult::NotFound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulationSelector {
    pub selector: String,
    pub text: String,
}

/// Filter engine operations backed by a [`ScriptRuntimeHost`]
#[derive(Debug, Clone)]
pub struct FilterEngine {
    host: ScriptRuntimeHost,
}

impl FilterEngine {
    pub fn new(host: ScriptRuntimeHost) -> Self {
        Self { host }
    }

    /// Installs the configured logger, creates a host from `config`, then
    /// loads the core bundle and its subscriptions. A subscriber installed
    /// earlier by the application is kept.
    ///
    /// # Errors
    ///
    /// Returns the initialization failure of the host
    pub fn start(config: &Config, scheduler: Arc<dyn HostScheduler>) -> Result<Self, InitError> {
        if let Err(e) = config.logger.init() {
            debug!(error = %e, "Keeping existing logger");
        }

        let host = ScriptRuntimeHost::new(HostOptions::from_config(config), scheduler);
        host.initialize(&config.core_bundle_path(), &config.subscription_paths())?;
        Ok(Self::new(host))
    }

    pub fn host(&self) -> &ScriptRuntimeHost {
        &self.host
    }

    /// # Errors
    ///
    /// Propagates the [`ApiError`] of the underlying `checkFilterMatch` call
    pub fn matches(
        &self,
        url: &str,
        content_types: u32,
        parent_url: &str,
        site_key: &str,
        specific_only: bool,
    ) -> Result<MatchesResult, ApiError> {
        let result = self.check_filter_match(url, content_types, parent_url, site_key, specific_only)?;
        Ok(MatchesResult::from_script(&result))
    }

    /// True if any url of the referrer chain has a matching filter, each url
    /// is checked against the next one as its parent. The last url, or one
    /// followed by an empty entry, is its own parent.
    ///
    /// # Errors
    ///
    /// Propagates the first failing `checkFilterMatch` call
    pub fn is_content_allowlisted(
        &self,
        content_types: u32,
        referrer_chain: &[String],
        site_key: &str,
    ) -> Result<bool, ApiError> {
        for (index, url) in referrer_chain.iter().enumerate() {
            let parent = referrer_chain
                .get(index + 1)
                .filter(|parent| !parent.is_empty())
                .unwrap_or(url);
            let result = self.check_filter_match(url, content_types, parent, site_key, false)?;
            if result.is_string() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// # Errors
    ///
    /// Propagates the [`ApiError`] of `getElementHidingStyleSheet`
    pub fn element_hiding_style_sheet(
        &self,
        domain: &str,
        specific_only: bool,
    ) -> Result<String, ApiError> {
        let result = self.call(
            "getElementHidingStyleSheet",
            vec![json!(domain), json!(specific_only)],
        )?;
        Ok(result.as_str().unwrap_or_default().to_owned())
    }

    /// # Errors
    ///
    /// Fails if `getElementHidingEmulationSelectors` fails or does not return
    /// a list of `{selector, text}` objects
    pub fn element_hiding_emulation_selectors(
        &self,
        domain: &str,
    ) -> Result<Vec<EmulationSelector>, ApiError> {
        self.call_typed("getElementHidingEmulationSelectors", vec![json!(domain)])
    }

    /// # Errors
    ///
    /// Fails if the bundle rejects the filter text
    pub fn add_filter(&self, text: &str) -> Result<(), ApiError> {
        self.call("addFilter", vec![json!(text)]).map(drop)
    }

    /// # Errors
    ///
    /// Propagates the [`ApiError`] of `removeFilter`
    pub fn remove_filter(&self, text: &str) -> Result<(), ApiError> {
        self.call("removeFilter", vec![json!(text)]).map(drop)
    }

    /// # Errors
    ///
    /// Propagates the [`ApiError`] of `clearFilters`
    pub fn clear_filters(&self) -> Result<(), ApiError> {
        self.call("clearFilters", Vec::new()).map(drop)
    }

    /// # Errors
    ///
    /// Propagates the [`ApiError`] of `isListedSubscription`
    pub fn is_listed_subscription(&self, url: &str) -> Result<bool, ApiError> {
        let result = self.call("isListedSubscription", vec![json!(url)])?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// # Errors
    ///
    /// Propagates the [`ApiError`] of `addSubscriptionToList`
    pub fn add_subscription(&self, url: &str) -> Result<(), ApiError> {
        self.call("addSubscriptionToList", vec![json!(url)]).map(drop)
    }

    /// # Errors
    ///
    /// Propagates the [`ApiError`] of `removeSubscriptionFromList`
    pub fn remove_subscription(&self, url: &str) -> Result<(), ApiError> {
        self.call("removeSubscriptionFromList", vec![json!(url)])
            .map(drop)
    }

    /// # Errors
    ///
    /// Fails if `getListedSubscriptions` does not return a list of urls
    pub fn listed_subscriptions(&self) -> Result<Vec<String>, ApiError> {
        self.call_typed("getListedSubscriptions", Vec::new())
    }

    /// # Errors
    ///
    /// Propagates the [`ApiError`] of `setAASubscriptionEnabled`
    pub fn set_aa_enabled(&self, enabled: bool) -> Result<(), ApiError> {
        self.call("setAASubscriptionEnabled", vec![json!(enabled)])
            .map(drop)
    }

    fn check_filter_match(
        &self,
        url: &str,
        content_types: u32,
        parent_url: &str,
        site_key: &str,
        specific_only: bool,
    ) -> Result<Value, ApiError> {
        self.call(
            "checkFilterMatch",
            vec![
                json!(url),
                json!(content_types),
                json!(parent_url),
                json!(site_key),
                json!(specific_only),
            ],
        )
    }

    fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, ApiError> {
        self.host.query_api(function, args)
    }

    fn call_typed<T: serde::de::DeserializeOwned>(
        &self,
        function: &str,
        args: Vec<Value>,
    ) -> Result<T, ApiError> {
        let value = self.call(function, args)?;
        serde_json::from_value(value).map_err(|e| ApiError::UnexpectedResult {
            function: function.to_owned(),
            message: e.to_string(),
        })
    }
}
