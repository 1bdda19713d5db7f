//! HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::{AppState, ClientIp};
use crate::countries;
use crate::emission::PageCalculation;
use crate::error::{Error, Result};
use crate::estimate::IntensityReport;
use crate::model::{EmissionEstimate, EstimateMode, Pageview, Website, YearMonth};

pub async fn health() -> &'static str {
    "ok"
}

fn parse_site_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| Error::validation(format!("invalid URL '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::validation(format!("unsupported URL scheme '{}'", url.scheme())));
    }
    Ok(url)
}

/// Websites are keyed by host, with a leading `www.` folded away
fn site_domain(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub url: String,
}

pub async fn register_website(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Website>)> {
    let url = parse_site_url(&body.url)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::validation(format!("URL '{}' has no host", body.url)))?;
    let website = state.db.insert_website(&site_domain(host), url.as_str(), Utc::now()).await?;
    info!("Registered website {} ({})", website.id, website.domain);
    Ok((StatusCode::CREATED, Json(website)))
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub domain: String,
    pub url: String,
}

pub async fn track_event(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    headers: HeaderMap,
    Json(body): Json<EventRequest>,
) -> Result<StatusCode> {
    parse_site_url(&body.url)?;
    let domain = site_domain(&body.domain);
    let website = state
        .db
        .find_website_by_domain(&domain)
        .await?
        .ok_or_else(|| Error::NotFound(format!("website {}", domain)))?;

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let now = Utc::now();
    let pageview = Pageview {
        website_id: website.id,
        visitor_id: state.visitors.visitor_id(website.id, &ip, user_agent, now),
        country_code: state.geoip.country(&ip),
        timestamp: now,
    };

    if state.pageview_tx.send(pageview).is_err() {
        warn!("Write buffer closed, dropping pageview for website {}", website.id);
    }
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct EmissionsQuery {
    pub mode: Option<String>,
}

pub async fn website_emissions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<EmissionsQuery>,
) -> Result<Json<EmissionEstimate>> {
    let mode = match query.mode.as_deref() {
        None | Some("") => EstimateMode::Pageview,
        Some(mode) => mode.parse()?,
    };
    let estimate = state.estimator.estimate(id, mode, Utc::now()).await?;
    Ok(Json(estimate))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub website_id: i64,
    pub generation: String,
    pub updated_at: DateTime<Utc>,
    pub resources: usize,
}

pub async fn force_scan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<ScanSummary>> {
    let authorized = match auth {
        Some(TypedHeader(Authorization(bearer))) => {
            !state.admin_token.is_empty() && bearer.token() == state.admin_token
        }
        None => false,
    };
    if !authorized {
        return Err(Error::Unauthorized);
    }

    let website = state
        .db
        .get_website(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("website {}", id)))?;
    let scan = state.estimator.refresher().force_refresh(&website, Utc::now()).await?;
    Ok(Json(ScanSummary {
        website_id: scan.website_id,
        generation: scan.generation,
        updated_at: scan.updated_at,
        resources: scan.resources.len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CalculateQuery {
    pub url: String,
}

pub async fn calculate(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CalculateQuery>,
) -> Result<Json<PageCalculation>> {
    let calc = state.estimator.calculate(&query.url, Utc::now()).await?;
    Ok(Json(calc))
}

#[derive(Debug, Deserialize)]
pub struct IntensityQuery {
    /// Comma separated alpha-2 codes
    pub countries: Option<String>,
    pub month: Option<u32>,
    pub year: Option<i32>,
}

fn parse_countries(raw: Option<&str>) -> Result<BTreeSet<String>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| {
            countries::normalize_alpha2(code)
                .map(str::to_string)
                .ok_or_else(|| Error::validation(format!("unknown country code '{}'", code)))
        })
        .collect()
}

pub async fn intensity(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IntensityQuery>,
) -> Result<Json<IntensityReport>> {
    let countries = parse_countries(query.countries.as_deref())?;
    let now = Utc::now();
    let target = YearMonth::new(
        query.year.unwrap_or_else(|| now.year()),
        query.month.unwrap_or_else(|| now.month()),
    )?;
    let report = state.estimator.intensities(&countries, target).await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::start_write_buffer;
    use crate::estimate::tests::{fixture, Fixture};
    use crate::geoip::GeoIp;
    use crate::visitor::VisitorHasher;
    use crate::web::router;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app() -> (Router, Fixture) {
        let f = fixture().await;
        let state = Arc::new(AppState {
            db: f.db.clone(),
            estimator: f.estimator.clone(),
            geoip: Arc::new(GeoIp::disabled()),
            visitors: VisitorHasher::new(),
            pageview_tx: start_write_buffer(Arc::new(f.db.clone())),
            admin_token: "secret".into(),
        });
        (router(state), f)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register(app: &Router) -> i64 {
        let response = app
            .clone()
            .oneshot(post_json("/api/websites", serde_json::json!({ "url": "https://example.com" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await["id"].as_i64().unwrap()
    }

    #[test]
    fn folds_www_into_domain() {
        assert_eq!(site_domain("WWW.Example.com."), "example.com");
        assert_eq!(site_domain("blog.example.com"), "blog.example.com");
    }

    #[test]
    fn parses_country_lists() {
        let parsed = parse_countries(Some("de, fr,,DE")).unwrap();
        assert_eq!(parsed.into_iter().collect::<Vec<_>>(), vec!["DE", "FR"]);
        assert!(parse_countries(None).unwrap().is_empty());
        assert!(matches!(parse_countries(Some("XX")), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _) = app().await;
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["cache-control"], "no-store");
    }

    #[tokio::test]
    async fn registers_and_estimates() {
        let (app, _) = app().await;
        let id = register(&app).await;

        let response = app
            .clone()
            .oneshot(get(&format!("/api/websites/{}/emissions?mode=pageview", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["domains"], 1);
        assert_eq!(body["greenDomains"], 0);
        assert!(body["emission"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (app, _) = app().await;
        register(&app).await;
        let response = app
            .oneshot(post_json("/api/websites", serde_json::json!({ "url": "https://www.example.com/" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_bad_mode_and_unknown_website() {
        let (app, _) = app().await;
        let id = register(&app).await;

        let response = app
            .clone()
            .oneshot(get(&format!("/api/websites/{}/emissions?mode=monthly", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].as_str().unwrap().contains("monthly"));

        let response = app.oneshot(get("/api/websites/999/emissions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn forced_scan_requires_token() {
        let (app, _) = app().await;
        let id = register(&app).await;
        let uri = format!("/api/websites/{}/scan", id);

        let response = app
            .clone()
            .oneshot(Request::builder().method("POST").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&uri)
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&uri)
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["resources"], 1);
    }

    #[tokio::test]
    async fn tracks_pageviews_for_known_domains() {
        let (app, f) = app().await;
        let id = register(&app).await;

        let unknown = app
            .clone()
            .oneshot(post_json(
                "/api/event",
                serde_json::json!({ "domain": "other.org", "url": "https://other.org/" }),
            ))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let mut request = post_json(
            "/api/event",
            serde_json::json!({ "domain": "www.example.com", "url": "https://www.example.com/about" }),
        );
        request.headers_mut().insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        request.headers_mut().insert("user-agent", "test-agent".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut stored = Vec::new();
        for _ in 0..40 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stored = f.db.pageviews_since(id, Utc::now() - chrono::Duration::hours(1)).await.unwrap();
            if !stored.is_empty() {
                break;
            }
        }
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].visitor_id.len(), 32);
    }

    #[tokio::test]
    async fn intensity_endpoint_validates_input() {
        let (app, _) = app().await;

        let response = app
            .clone()
            .oneshot(get("/api/intensity?countries=DE,FR&month=1&year=2023"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["predicted"]["DE"].is_object());
        assert!(body["global"].as_f64().is_some());

        let response = app
            .clone()
            .oneshot(get("/api/intensity?countries=ZZ"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(get("/api/intensity?month=13")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
