//! Device query registry.
//!
//! Answers the point-in-time environment queries of the control protocol
//! (`getColorScheme`, `getLocation`, ...). Raw facts come from a
//! [`DeviceEnvironment`], the platform seam; [`StaticEnvironment`] is an
//! in-memory implementation for demos and tests.
//!
//! Queries that can fail never surface an error across the channel. The
//! registry converts every [`QueryError`] into a structured reply value:
//!
//! ```text
//! {"error": {"kind": "PermissionDenied", "message": "location permission not granted"}}
//! ```

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AppManifest, ConfigError};
use crate::protocol::DeviceQuery;

/// How long a location fix may take before the query fails.
pub const LOCATION_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of a device query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The user declined a capability prompt.
    #[error("{0}")]
    PermissionDenied(String),

    /// The capability exists but produced no data.
    #[error("{0}")]
    Unavailable(String),

    /// The platform did not answer in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    /// Stable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::PermissionDenied(_) => "PermissionDenied",
            QueryError::Unavailable(_) => "Unavailable",
            QueryError::Timeout(_) => "Timeout",
        }
    }

    /// The structured reply value for this failure.
    pub fn to_value(&self) -> Value {
        json!({ "error": { "kind": self.kind(), "message": self.to_string() } })
    }
}

// ---------------------------------------------------------------------------
// Platform facts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorScheme {
    Light,
    Dark,
}

/// Foreground/background lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppLifecycle {
    Active,
    Background,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// A user locale, in preference order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locale {
    pub language_code: String,
    pub country_code: String,
    pub language_tag: String,
    #[serde(rename = "isRTL")]
    pub is_rtl: bool,
}

impl Locale {
    /// Builds a left-to-right locale from language and country codes.
    pub fn new(language: &str, country: &str) -> Self {
        Self {
            language_code: language.to_string(),
            country_code: country.to_string(),
            language_tag: format!("{language}-{country}"),
            is_rtl: false,
        }
    }
}

/// A location fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

/// Source of raw device facts.
#[async_trait]
pub trait DeviceEnvironment: Send + Sync {
    fn color_scheme(&self) -> ColorScheme;

    /// Current window size in points, `(width, height)`.
    fn window_size(&self) -> (f64, f64);

    fn font_scale(&self) -> f64;

    fn app_state(&self) -> AppLifecycle;

    /// User locales, most preferred first.
    fn locales(&self) -> Vec<Locale>;

    /// Prompts for location access.
    async fn request_location_permission(&self) -> PermissionStatus;

    /// The latest location fix, if any. May take arbitrarily long.
    async fn latest_location(&self) -> Option<Position>;

    async fn biometric_sensor_available(&self) -> bool;

    /// Shows an interactive biometric prompt and returns whether it passed.
    async fn biometric_prompt(&self) -> bool;
}

/// Mutable facts served by [`StaticEnvironment`].
#[derive(Debug, Clone)]
pub struct EnvironmentState {
    pub color_scheme: ColorScheme,
    pub window_size: (f64, f64),
    pub font_scale: f64,
    pub app_state: AppLifecycle,
    pub locales: Vec<Locale>,
    pub location_permission: PermissionStatus,
    pub location: Option<Position>,
    /// Simulated time to acquire a fix.
    pub location_delay: Duration,
    pub biometrics_available: bool,
    pub biometrics_pass: bool,
}

impl Default for EnvironmentState {
    fn default() -> Self {
        Self {
            color_scheme: ColorScheme::Light,
            window_size: (390.0, 844.0),
            font_scale: 1.0,
            app_state: AppLifecycle::Active,
            locales: vec![Locale::new("en", "US")],
            location_permission: PermissionStatus::Granted,
            location: Some(Position {
                latitude: 52.2297,
                longitude: 21.0122,
                accuracy: 5.0,
            }),
            location_delay: Duration::ZERO,
            biometrics_available: true,
            biometrics_pass: true,
        }
    }
}

/// In-memory [`DeviceEnvironment`].
#[derive(Debug, Default)]
pub struct StaticEnvironment {
    state: RwLock<EnvironmentState>,
}

impl StaticEnvironment {
    pub fn new(state: EnvironmentState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// A snapshot of the current facts.
    pub fn state(&self) -> EnvironmentState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Mutates the facts in place (rotation, theme switch, ...).
    pub fn update(&self, f: impl FnOnce(&mut EnvironmentState)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *state);
    }
}

#[async_trait]
impl DeviceEnvironment for StaticEnvironment {
    fn color_scheme(&self) -> ColorScheme {
        self.state().color_scheme
    }

    fn window_size(&self) -> (f64, f64) {
        self.state().window_size
    }

    fn font_scale(&self) -> f64 {
        self.state().font_scale
    }

    fn app_state(&self) -> AppLifecycle {
        self.state().app_state
    }

    fn locales(&self) -> Vec<Locale> {
        self.state().locales
    }

    async fn request_location_permission(&self) -> PermissionStatus {
        self.state().location_permission
    }

    async fn latest_location(&self) -> Option<Position> {
        let EnvironmentState {
            location,
            location_delay,
            ..
        } = self.state();
        if !location_delay.is_zero() {
            tokio::time::sleep(location_delay).await;
        }
        location
    }

    async fn biometric_sensor_available(&self) -> bool {
        self.state().biometrics_available
    }

    async fn biometric_prompt(&self) -> bool {
        self.state().biometrics_pass
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Answers [`DeviceQuery`]s from a [`DeviceEnvironment`].
#[derive(Clone)]
pub struct DeviceQueryRegistry {
    environment: Arc<dyn DeviceEnvironment>,
    app_name: String,
    location_timeout: Duration,
}

impl DeviceQueryRegistry {
    /// Creates a registry whose app identity is resolved from `manifest`.
    pub fn new(
        environment: Arc<dyn DeviceEnvironment>,
        manifest: &AppManifest,
    ) -> Result<Self, ConfigError> {
        Ok(Self::with_app_name(environment, manifest.app_name()?))
    }

    pub fn with_app_name(environment: Arc<dyn DeviceEnvironment>, app_name: impl Into<String>) -> Self {
        Self {
            environment,
            app_name: app_name.into(),
            location_timeout: LOCATION_TIMEOUT,
        }
    }

    pub fn with_location_timeout(mut self, timeout: Duration) -> Self {
        self.location_timeout = timeout;
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Answers a query that needs no awaiting. Returns `None` for
    /// [asynchronous](DeviceQuery::is_async) queries.
    pub fn answer_now(&self, query: DeviceQuery) -> Option<Value> {
        let env = &self.environment;
        let value = match query {
            DeviceQuery::ColorScheme => json!(env.color_scheme()),
            DeviceQuery::Orientation => {
                let (width, height) = env.window_size();
                json!(if width > height { "landscape" } else { "portrait" })
            }
            DeviceQuery::FontSize => json!(env.font_scale()),
            DeviceQuery::AppState => json!(env.app_state()),
            DeviceQuery::AppName => json!(self.app_name),
            DeviceQuery::Localization => match env.locales().into_iter().next() {
                Some(locale) => json!(locale),
                None => QueryError::Unavailable("no locale configured".to_string()).to_value(),
            },
            DeviceQuery::Location
            | DeviceQuery::BiometricsAvailability
            | DeviceQuery::BiometricsCheck => return None,
        };
        Some(value)
    }

    /// Answers any query. Failures come back as structured values.
    pub async fn answer(&self, query: DeviceQuery) -> Value {
        if let Some(value) = self.answer_now(query) {
            return value;
        }
        match query {
            DeviceQuery::Location => match self.location().await {
                Ok(position) => json!(position),
                Err(e) => {
                    warn!(kind = e.kind(), error = %e, "Location query failed");
                    e.to_value()
                }
            },
            DeviceQuery::BiometricsAvailability => {
                json!(self.environment.biometric_sensor_available().await)
            }
            DeviceQuery::BiometricsCheck => {
                let passed = self.environment.biometric_prompt().await;
                debug!(passed, "Biometric prompt finished");
                json!(passed)
            }
            _ => Value::Null,
        }
    }

    /// Requests permission, then waits for a fix.
    ///
    /// # Errors
    ///
    /// - [`QueryError::PermissionDenied`] if the prompt is declined.
    /// - [`QueryError::Timeout`] if no fix arrives within the location timeout.
    /// - [`QueryError::Unavailable`] if the platform has no fix.
    pub async fn location(&self) -> Result<Position, QueryError> {
        if self.environment.request_location_permission().await == PermissionStatus::Denied {
            return Err(QueryError::PermissionDenied(
                "location permission not granted".to_string(),
            ));
        }
        tokio::time::timeout(self.location_timeout, self.environment.latest_location())
            .await
            .map_err(|_| QueryError::Timeout(self.location_timeout))?
            .ok_or_else(|| QueryError::Unavailable("unable to get location".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(state: EnvironmentState) -> (Arc<StaticEnvironment>, DeviceQueryRegistry) {
        let environment = Arc::new(StaticEnvironment::new(state));
        let registry = DeviceQueryRegistry::with_app_name(environment.clone(), "demo");
        (environment, registry)
    }

    #[test]
    fn orientation_follows_window_size() {
        let (environment, registry) = registry(EnvironmentState::default());
        assert_eq!(registry.answer_now(DeviceQuery::Orientation), Some(json!("portrait")));

        environment.update(|state| state.window_size = (844.0, 390.0));
        assert_eq!(registry.answer_now(DeviceQuery::Orientation), Some(json!("landscape")));
    }

    #[test]
    fn square_window_is_portrait() {
        let (_, registry) = registry(EnvironmentState {
            window_size: (500.0, 500.0),
            ..EnvironmentState::default()
        });
        assert_eq!(registry.answer_now(DeviceQuery::Orientation), Some(json!("portrait")));
    }

    #[test]
    fn sync_query_values() {
        let (_, registry) = registry(EnvironmentState {
            color_scheme: ColorScheme::Dark,
            font_scale: 1.25,
            app_state: AppLifecycle::Background,
            ..EnvironmentState::default()
        });
        assert_eq!(registry.answer_now(DeviceQuery::ColorScheme), Some(json!("dark")));
        assert_eq!(registry.answer_now(DeviceQuery::FontSize), Some(json!(1.25)));
        assert_eq!(registry.answer_now(DeviceQuery::AppState), Some(json!("background")));
        assert_eq!(registry.answer_now(DeviceQuery::AppName), Some(json!("demo")));
        assert_eq!(registry.answer_now(DeviceQuery::Location), None);
    }

    #[test]
    fn localization_returns_primary_locale() {
        let (_, registry) = registry(EnvironmentState {
            locales: vec![Locale::new("pl", "PL"), Locale::new("en", "US")],
            ..EnvironmentState::default()
        });
        assert_eq!(
            registry.answer_now(DeviceQuery::Localization),
            Some(json!({"languageCode": "pl", "countryCode": "PL", "languageTag": "pl-PL", "isRTL": false}))
        );
    }

    #[test]
    fn app_name_comes_from_manifest() {
        let manifest = AppManifest::from_json(r#"{"expo": {"name": "expo-demo"}}"#).unwrap();
        let registry =
            DeviceQueryRegistry::new(Arc::new(StaticEnvironment::default()), &manifest).unwrap();
        assert_eq!(registry.app_name(), "expo-demo");
    }

    #[tokio::test]
    async fn denied_permission_is_structured() {
        let (_, registry) = registry(EnvironmentState {
            location_permission: PermissionStatus::Denied,
            ..EnvironmentState::default()
        });
        let value = registry.answer(DeviceQuery::Location).await;
        assert_eq!(value["error"]["kind"], "PermissionDenied");
        assert!(value["error"]["message"].as_str().unwrap().contains("permission"));
    }

    #[tokio::test]
    async fn missing_fix_is_unavailable() {
        let (_, registry) = registry(EnvironmentState {
            location: None,
            ..EnvironmentState::default()
        });
        assert_eq!(
            registry.location().await,
            Err(QueryError::Unavailable("unable to get location".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fix_times_out() {
        let (_, registry) = registry(EnvironmentState {
            location_delay: Duration::from_secs(30),
            ..EnvironmentState::default()
        });
        assert_eq!(registry.location().await, Err(QueryError::Timeout(LOCATION_TIMEOUT)));
    }

    #[tokio::test]
    async fn async_queries_answer() {
        let (environment, registry) = registry(EnvironmentState::default());
        assert_eq!(
            registry.answer(DeviceQuery::Location).await,
            json!({"latitude": 52.2297, "longitude": 21.0122, "accuracy": 5.0})
        );
        assert_eq!(registry.answer(DeviceQuery::BiometricsAvailability).await, json!(true));

        environment.update(|state| state.biometrics_pass = false);
        assert_eq!(registry.answer(DeviceQuery::BiometricsCheck).await, json!(false));
    }
}
