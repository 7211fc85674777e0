//! DNS-over-HTTPS, RFC 8484: `GET /dns-query?dns=<base64url>` and
//! `POST /dns-query` with `application/dns-message` bodies, plus the
//! informal `application/dns-json` answer shape for `?name=&type=` queries.

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::enums::{Rcode, RecordType};
use crate::message::{extract_min_ttl, Message};
use crate::pipeline::QueryProtocol;
use crate::reply::Reply;
use crate::resourcerecord::InternalResourceRecord;
use crate::web::ApiState;
use crate::{Header, Question};

#[derive(Debug, Serialize)]
pub struct JSONQuestion {
    name: String,
    #[serde(rename = "type")]
    qtype: u16,
}

#[derive(Debug, Serialize)]
pub struct JSONRecord {
    name: String,
    #[serde(rename = "type")]
    qtype: u16,
    #[serde(rename = "TTL")]
    ttl: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct JSONResponse {
    status: u32,
    /// Response was truncated
    #[serde(rename = "tc")]
    truncated: bool,
    #[serde(rename = "rd")]
    recursion_desired: bool,
    #[serde(rename = "ra")]
    recursion_available: bool,
    ad: bool,
    #[serde(rename = "cd")]
    checking_disabled: bool,
    #[serde(rename = "Question")]
    question: Vec<JSONQuestion>,
    #[serde(rename = "Answer")]
    answer: Vec<JSONRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetQueryString {
    /// Base64url-encoded raw question bytes
    dns: Option<String>,
    /// QNAME for the JSON shape
    name: Option<String>,
    /// Query type for the JSON shape, defaults to A
    #[serde(alias = "type", default)]
    rrtype: Option<String>,
}

fn response_400() -> Response {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("Cache-Control", "max-age=1")
        .body(Body::empty())
        .unwrap_or_default()
}

fn response_500() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("Cache-Control", "max-age=1")
        .body(Body::empty())
        .unwrap_or_default()
}

fn wire_response(bytes: Vec<u8>) -> Response {
    let ttl = extract_min_ttl(&bytes);
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-type", "application/dns-message")
        .header("Cache-Control", format!("max-age={ttl}"))
        .body(Body::from(bytes))
        .unwrap_or_default()
}

async fn run_query(state: &ApiState, addr: SocketAddr, query: &[u8]) -> Option<Vec<u8>> {
    match state
        .pipeline
        .handle_query(query, addr, QueryProtocol::DoH)
        .await
    {
        Ok(response) => Some(response),
        Err(err) => {
            tracing::debug!("DoH query from {addr} failed: {err}");
            None
        }
    }
}

pub async fn handle_get(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<GetQueryString>,
) -> Response {
    if let Some(dns) = params.dns {
        let query = match URL_SAFE_NO_PAD.decode(dns.trim_end_matches('=')) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!("failed to decode DoH GET payload: {err:?}");
                return response_400();
            }
        };
        return match run_query(&state, addr, &query).await {
            Some(response) => wire_response(response),
            None => response_500(),
        };
    }

    // the JSON shape: ?name=example.com&type=AAAA
    let Some(name) = params.name else {
        return response_400();
    };
    let rrtype = RecordType::from(params.rrtype.unwrap_or_else(|| "A".to_string()).as_str());
    if rrtype == RecordType::InvalidType {
        return response_400();
    }
    let wants_json = headers
        .get("accept")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/dns-json"));

    let mut query = Reply {
        header: Header {
            id: 0,
            recursion_desired: true,
            ..Default::default()
        },
        question: Some(Question {
            qname: name.to_lowercase(),
            qtype: rrtype,
            qclass: crate::enums::RecordClass::Internet,
        }),
        answers: vec![],
        authorities: vec![],
        additionals: vec![],
    };
    let Ok(query_bytes) = query.as_bytes() else {
        return response_500();
    };
    let Some(response) = run_query(&state, addr, &query_bytes).await else {
        return response_500();
    };
    if !wants_json {
        return wire_response(response);
    }

    let Ok(message) = Message::parse(&response) else {
        return response_500();
    };
    let answer = message
        .answers
        .iter()
        .map(|rr| JSONRecord {
            name: rr.name.clone(),
            qtype: rr.record_type as u16,
            ttl: rr.ttl,
            data: InternalResourceRecord::from_wire(rr.record_type, rr.ttl, &rr.rdata)
                .ok()
                .map(|typed| typed.to_string()),
        })
        .collect();
    let json = JSONResponse {
        status: match message.header.rcode {
            Rcode::NoError => 0,
            other => other as u32,
        },
        truncated: message.header.truncated,
        recursion_desired: message.header.recursion_desired,
        recursion_available: message.header.recursion_available,
        ad: message.header.ad,
        checking_disabled: message.header.cd,
        question: vec![JSONQuestion {
            name,
            qtype: rrtype as u16,
        }],
        answer,
    };
    let ttl = message.min_answer_ttl().unwrap_or(1);
    match serde_json::to_string(&json) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-type", "application/dns-json")
            .header("Cache-Control", format!("max-age={ttl}"))
            .body(Body::from(body))
            .unwrap_or_default(),
        Err(_) => response_500(),
    }
}

pub async fn handle_post(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if content_type != "application/dns-message" {
        return response_400();
    }
    match run_query(&state, addr, &body).await {
        Some(response) => wire_response(response),
        None => response_500(),
    }
}

pub fn new() -> Router<ApiState> {
    Router::new().route("/", get(handle_get).post(handle_post))
}
