//! Geocoding and forecast HTTP client.
//!
//! Coordinates resolve through a primary geocoder with a fallback; the
//! fallback operator requires an identifying user agent on every request.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use wayfarer_common::{Coordinates, CoreError, HourlyForecast, Result, WeatherSettings};

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    latitude: f64,
    longitude: f64,
}

/// The fallback geocoder returns coordinates as strings.
#[derive(Debug, Deserialize)]
struct FallbackGeocodeResult {
    lat: String,
    lon: String,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentWeather,
    hourly: HourlySeries,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    temperature_2m: f64,
    weather_code: i32,
}

#[derive(Debug, Deserialize)]
struct HourlySeries {
    time: Vec<i64>,
    temperature_2m: Vec<f64>,
    weather_code: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct Forecast {
    pub current_temp: f64,
    pub weather_code: i32,
    pub hourly: Vec<HourlyForecast>,
}

pub struct WeatherClient {
    http: Client,
    settings: WeatherSettings,
}

impl WeatherClient {
    pub fn new(settings: WeatherSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| CoreError::transport(format!("weather client init: {}", e)))?;
        Ok(Self { http, settings })
    }

    /// Resolve an address to coordinates, trying the primary geocoder first.
    pub async fn geocode(&self, address: &str) -> Result<Coordinates> {
        match self.geocode_primary(address).await {
            Ok(coords) => Ok(coords),
            Err(e) => {
                warn!(address, error = %e, "primary geocoder failed, trying fallback");
                self.geocode_fallback(address).await
            }
        }
    }

    async fn geocode_primary(&self, address: &str) -> Result<Coordinates> {
        let response = self
            .http
            .get(&self.settings.geocoder_url)
            .query(&[("name", address), ("count", "1")])
            .send()
            .await
            .map_err(|e| CoreError::transport(format!("geocoder request: {}", e)))?
            .error_for_status()
            .map_err(|e| CoreError::transport(format!("geocoder status: {}", e)))?;

        let parsed: GeocodeResponse = response
            .json()
            .await
            .map_err(|e| CoreError::transport(format!("geocoder decode: {}", e)))?;
        let result = parsed
            .results
            .first()
            .ok_or_else(|| CoreError::not_found(format!("no geocode result for '{}'", address)))?;
        Ok(Coordinates {
            latitude: result.latitude,
            longitude: result.longitude,
        })
    }

    async fn geocode_fallback(&self, address: &str) -> Result<Coordinates> {
        let response = self
            .http
            .get(&self.settings.fallback_geocoder_url)
            // The client already carries the identifying user agent the
            // fallback requires.
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(|e| CoreError::transport(format!("fallback geocoder request: {}", e)))?
            .error_for_status()
            .map_err(|e| CoreError::transport(format!("fallback geocoder status: {}", e)))?;

        let parsed: Vec<FallbackGeocodeResult> = response
            .json()
            .await
            .map_err(|e| CoreError::transport(format!("fallback geocoder decode: {}", e)))?;
        let result = parsed
            .first()
            .ok_or_else(|| CoreError::not_found(format!("no geocode result for '{}'", address)))?;

        let latitude: f64 = result
            .lat
            .parse()
            .map_err(|_| CoreError::transport("fallback geocoder returned malformed latitude"))?;
        let longitude: f64 = result
            .lon
            .parse()
            .map_err(|_| CoreError::transport("fallback geocoder returned malformed longitude"))?;
        Ok(Coordinates {
            latitude,
            longitude,
        })
    }

    /// Current conditions plus a 48-hour hourly forecast.
    pub async fn forecast(&self, coords: &Coordinates) -> Result<Forecast> {
        let response = self
            .http
            .get(&self.settings.forecast_url)
            .query(&[
                ("latitude", coords.latitude.to_string()),
                ("longitude", coords.longitude.to_string()),
                ("current", "temperature_2m,weather_code".to_string()),
                ("hourly", "temperature_2m,weather_code".to_string()),
                ("forecast_hours", "48".to_string()),
                ("timeformat", "unixtime".to_string()),
            ])
            .send()
            .await
            .map_err(|e| CoreError::transport(format!("forecast request: {}", e)))?
            .error_for_status()
            .map_err(|e| CoreError::transport(format!("forecast status: {}", e)))?;

        let parsed: ForecastResponse = response
            .json()
            .await
            .map_err(|e| CoreError::transport(format!("forecast decode: {}", e)))?;

        let hourly = parsed
            .hourly
            .time
            .iter()
            .zip(parsed.hourly.temperature_2m.iter())
            .zip(parsed.hourly.weather_code.iter())
            .filter_map(|((time, temp), code)| {
                let time: DateTime<Utc> = DateTime::from_timestamp(*time, 0)?;
                Some(HourlyForecast {
                    time,
                    temperature: *temp,
                    weather_code: *code,
                })
            })
            .collect();

        debug!(latitude = coords.latitude, longitude = coords.longitude, "forecast fetched");
        Ok(Forecast {
            current_temp: parsed.current.temperature_2m,
            weather_code: parsed.current.weather_code,
            hourly,
        })
    }
}
