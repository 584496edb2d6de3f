use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use chrono_tz::Tz;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::collections::HashMap;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::PriceForecaster;
use crate::domain::{ForecastKind, ForecastSeries};

pub const DEFAULT_BASE_URL: &str = "https://dataportal-api.nordpoolgroup.com";

/// Delivery days are CET/CEST calendar days
const MARKET_TZ: Tz = chrono_tz::Europe::Oslo;

/// Day-ahead prices from the Nord Pool data portal, EUR/MWh converted to EUR/kWh
#[derive(Clone)]
pub struct NordpoolPriceForecaster {
    base_url: String,
    area: String,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<(DateTime<Utc>, NaiveDate, ForecastSeries)>>>,
    ttl: Duration,
}

impl NordpoolPriceForecaster {
    pub fn new(base_url: String, area: String, ttl: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("intelligent-flow-controller/0.3"),
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url,
            area,
            client,
            cache: Arc::new(RwLock::new(None)),
            ttl,
        })
    }

    fn url_for(&self, date: NaiveDate) -> String {
        format!(
            "{}/api/DayAheadPrices?date={}&market=DayAhead&deliveryArea={}&currency=EUR",
            self.base_url.trim_end_matches('/'),
            date.format("%Y-%m-%d"),
            self.area
        )
    }

    async fn fetch_day(&self, date: NaiveDate) -> Result<Vec<RawEntry>> {
        let url = self.url_for(date);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("Nord Pool GET failed")?;
        let status = resp.status();
        // 204: prices for that day not published yet
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let body = resp.text().await.context("Nord Pool read failed")?;
        if !status.is_success() {
            anyhow::bail!("Nord Pool API error: HTTP {status}: {body}");
        }
        let parsed: DayAheadResponse =
            serde_json::from_str(&body).context("Nord Pool JSON parse failed")?;
        Ok(parsed.multi_area_entries)
    }

    fn to_series(&self, entries: Vec<RawEntry>) -> Result<ForecastSeries> {
        let mut points: Vec<(DateTime<Utc>, DateTime<Utc>, f64)> = entries
            .into_iter()
            .filter_map(|e| {
                e.entry_per_area
                    .get(&self.area)
                    .map(|eur_mwh| (e.delivery_start, e.delivery_end, eur_mwh / 1000.0))
            })
            .collect();
        points.sort_by_key(|(start, _, _)| *start);
        let (first_start, first_end, _) = *points
            .first()
            .context("Nord Pool returned no prices for the area")?;
        let resolution = (first_end - first_start).num_minutes();
        if resolution <= 0 {
            anyhow::bail!("Nord Pool returned an empty delivery period");
        }
        // Consecutive periods only; a gap ends the usable series
        let mut values = Vec::with_capacity(points.len());
        let mut expected = first_start;
        for (start, _, price) in points {
            if start != expected {
                break;
            }
            values.push(price);
            expected = start + ChronoDuration::minutes(resolution);
        }
        Ok(ForecastSeries::new(
            ForecastKind::Price,
            first_start,
            resolution as u32,
            values,
            Utc::now(),
        ))
    }
}

#[async_trait]
impl PriceForecaster for NordpoolPriceForecaster {
    async fn fetch_prices(&self, from: DateTime<Utc>) -> Result<ForecastSeries> {
        let today = from.with_timezone(&MARKET_TZ).date_naive();
        {
            let c = self.cache.read().await;
            if let Some((ts, day, series)) = &*c {
                if *day == today
                    && (Utc::now() - *ts).num_seconds() < self.ttl.as_secs() as i64
                {
                    debug!(area = %self.area, "Nord Pool prices served from cache");
                    return Ok(series.clone());
                }
            }
        }

        let mut entries = self.fetch_day(today).await?;
        if let Some(tomorrow) = today.succ_opt() {
            entries.extend(self.fetch_day(tomorrow).await?);
        }
        let series = self.to_series(entries)?;
        info!(
            area = %self.area,
            points = series.values.len(),
            resolution_minutes = series.resolution_minutes,
            "Nord Pool day-ahead prices fetched"
        );

        let mut c = self.cache.write().await;
        *c = Some((Utc::now(), today, series.clone()));
        Ok(series)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DayAheadResponse {
    #[serde(default)]
    multi_area_entries: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    delivery_start: DateTime<Utc>,
    delivery_end: DateTime<Utc>,
    entry_per_area: HashMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day_body(day: u32, price_eur_mwh: f64) -> serde_json::Value {
        let entries: Vec<_> = (0..96)
            .map(|q| {
                let start = Utc.with_ymd_and_hms(2024, 11, day, 0, 0, 0).unwrap()
                    + ChronoDuration::minutes(15 * q);
                json!({
                    "deliveryStart": start.to_rfc3339(),
                    "deliveryEnd": (start + ChronoDuration::minutes(15)).to_rfc3339(),
                    "entryPerArea": { "FI": price_eur_mwh, "SE3": 1.0 }
                })
            })
            .collect();
        json!({ "deliveryDateCET": format!("2024-11-{day:02}"), "multiAreaEntries": entries })
    }

    #[tokio::test]
    async fn test_fetches_two_days_and_converts_to_kwh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/DayAheadPrices"))
            .and(query_param("date", "2024-11-15"))
            .and(query_param("deliveryArea", "FI"))
            .respond_with(ResponseTemplate::new(200).set_body_json(day_body(15, 50.0)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/DayAheadPrices"))
            .and(query_param("date", "2024-11-16"))
            .respond_with(ResponseTemplate::new(200).set_body_json(day_body(16, 120.0)))
            .expect(1)
            .mount(&server)
            .await;

        let f = NordpoolPriceForecaster::new(server.uri(), "FI".into(), Duration::from_secs(3600))
            .unwrap();
        let from = Utc.with_ymd_and_hms(2024, 11, 15, 10, 0, 0).unwrap();
        let s = f.fetch_prices(from).await.unwrap();
        assert_eq!(s.resolution_minutes, 15);
        assert_eq!(s.values.len(), 192);
        assert!((s.values[0] - 0.05).abs() < 1e-12);
        assert!((s.values[100] - 0.12).abs() < 1e-12);

        // second call within the TTL stays off the network
        let again = f.fetch_prices(from).await.unwrap();
        assert_eq!(again.values.len(), 192);
    }

    #[tokio::test]
    async fn test_unpublished_tomorrow_is_tolerated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("date", "2024-11-15"))
            .respond_with(ResponseTemplate::new(200).set_body_json(day_body(15, 30.0)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("date", "2024-11-16"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let f = NordpoolPriceForecaster::new(server.uri(), "FI".into(), Duration::from_secs(60))
            .unwrap();
        let from = Utc.with_ymd_and_hms(2024, 11, 15, 10, 0, 0).unwrap();
        let s = f.fetch_prices(from).await.unwrap();
        assert_eq!(s.values.len(), 96);
    }

    #[tokio::test]
    async fn test_delivery_day_follows_market_time() {
        // 23:30 UTC is already the next delivery day in CET
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("date", "2024-11-16"))
            .respond_with(ResponseTemplate::new(200).set_body_json(day_body(16, 40.0)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("date", "2024-11-17"))
            .respond_with(ResponseTemplate::new(200).set_body_json(day_body(17, 60.0)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("date", "2024-11-15"))
            .respond_with(ResponseTemplate::new(200).set_body_json(day_body(15, 10.0)))
            .expect(0)
            .mount(&server)
            .await;

        let f = NordpoolPriceForecaster::new(server.uri(), "FI".into(), Duration::from_secs(60))
            .unwrap();
        let from = Utc.with_ymd_and_hms(2024, 11, 15, 23, 30, 0).unwrap();
        let s = f.fetch_prices(from).await.unwrap();
        assert_eq!(s.values.len(), 192);
        assert!((s.values[0] - 0.04).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let f = NordpoolPriceForecaster::new(server.uri(), "FI".into(), Duration::from_secs(60))
            .unwrap();
        let from = Utc.with_ymd_and_hms(2024, 11, 15, 10, 0, 0).unwrap();
        let err = f.fetch_prices(from).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
    }
}
