//! Database probe: a hosted REST data API (PostgREST-style `/rest/v1/`) via `curl`.
//!
//! The locator is the project URL, or `env` to read it from the configured
//! environment variable. The API key always comes from the environment; the
//! service key is preferred over the anon key when both are set.

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::core::config::DatabaseConfig;
use crate::core::external::{self, ExternalCapability};
use crate::core::model::{Facts, LadderResult, ProbeOutcome, Target, TargetKind};
use crate::core::probe::{Probe, ProbeError};
use crate::core::snapshot::{self, EntityRecord};

const REST_PREFIX: &str = "/rest/v1";

pub struct DatabaseProbe {
    config: DatabaseConfig,
    timeout: Duration,
}

struct Credentials {
    base_url: String,
    key: String,
    permission_level: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl DatabaseProbe {
    pub fn new(config: DatabaseConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn credentials(&self, target: &Target) -> Result<Credentials, ProbeError> {
        let base_url = if target.locator.eq_ignore_ascii_case("env") {
            env_value(&self.config.url_env).ok_or_else(|| {
                ProbeError::Connectivity(format!("${} is not set", self.config.url_env))
            })?
        } else {
            target.locator.clone()
        };
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(ProbeError::Connectivity(format!(
                "'{}' is not an http(s) URL",
                base_url
            )));
        }
        let (key, permission_level) = match env_value(&self.config.service_key_env) {
            Some(key) => (key, "service"),
            None => match env_value(&self.config.key_env) {
                Some(key) => (key, "anon"),
                None => {
                    return Err(ProbeError::Permission(format!(
                        "no API key in ${} or ${}",
                        self.config.service_key_env, self.config.key_env
                    )));
                }
            },
        };
        Ok(Credentials {
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
            permission_level,
        })
    }

    fn get(&self, creds: &Credentials, path: &str, prefer: Option<&str>) -> Result<HttpResponse, ProbeError> {
        let url = format!("{}{}{}", creds.base_url, REST_PREFIX, path);
        let max_time = self.timeout.as_secs().max(1).to_string();
        let mut headers = vec![
            format!("apikey: {}", creds.key),
            format!("Authorization: Bearer {}", creds.key),
            "Accept: application/json".to_string(),
        ];
        if let Some(p) = prefer {
            headers.push(format!("Prefer: {}", p));
        }
        // Headers carry the key, so they travel on stdin (`-K -`), never argv.
        let config = curl_header_config(&headers);
        let args = [
            "-s",
            "-S",
            "-D",
            "-",
            "--max-time",
            max_time.as_str(),
            "-K",
            "-",
            url.as_str(),
        ];

        let out = external::execute_with_input(
            ExternalCapability::HttpRead,
            "curl",
            &args,
            Path::new("."),
            Some(config.as_bytes()),
            self.timeout,
        )?;
        if !out.success() {
            return Err(ProbeError::Connectivity(format!(
                "curl exited with {:?}: {}",
                out.exit_code,
                out.stderr.lines().next().unwrap_or("").trim()
            )));
        }
        let response = parse_http_response(&out.stdout)?;
        match response.status {
            200..=299 => Ok(response),
            401 | 403 => Err(ProbeError::Permission(format!(
                "HTTP {} for {}{}",
                response.status, REST_PREFIX, path
            ))),
            status => Err(ProbeError::Connectivity(format!(
                "HTTP {} for {}{}",
                status, REST_PREFIX, path
            ))),
        }
    }

    fn connection(&self, creds: &Credentials) -> Result<ProbeOutcome, ProbeError> {
        let response = self.get(creds, "/", None)?;
        let mut facts = Facts::new();
        facts.insert("status".into(), json!("connected"));
        facts.insert("http_status".into(), json!(response.status));
        facts.insert("permission_level".into(), json!(creds.permission_level));
        facts.insert("endpoint".into(), json!(format!("{}{}/", creds.base_url, REST_PREFIX)));
        if let Some(remaining) = response
            .header("x-ratelimit-remaining")
            .and_then(|v| v.trim().parse::<i64>().ok())
        {
            facts.insert("rate_limit_remaining".into(), json!(remaining));
        }
        Ok(ProbeOutcome::success(facts))
    }

    fn tables(&self, creds: &Credentials) -> Result<ProbeOutcome, ProbeError> {
        let doc = self.openapi(creds)?;
        let tables: Vec<String> = table_definitions(&doc).keys().cloned().collect();
        let mut warnings = Vec::new();
        if tables.is_empty() {
            warnings.push("API exposes no table definitions with this key".to_string());
        }
        let mut facts = Facts::new();
        facts.insert("total_tables".into(), json!(tables.len()));
        facts.insert("tables".into(), json!(tables));
        Ok(ProbeOutcome::with_warnings(facts, warnings))
    }

    fn schema(&self, creds: &Credentials, so_far: &LadderResult) -> Result<ProbeOutcome, ProbeError> {
        let doc = self.openapi(creds)?;
        let definitions = table_definitions(&doc);
        let known: Vec<String> = so_far
            .facts(2)
            .and_then(|f| f.get("tables"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_else(|| definitions.keys().cloned().collect());

        let mut warnings = Vec::new();
        if known.len() > self.config.max_tables {
            warnings.push(format!(
                "schema inspected for first {} of {} tables",
                self.config.max_tables,
                known.len()
            ));
        }

        let mut schemas = Map::new();
        let mut total_columns = 0usize;
        for table in known.iter().take(self.config.max_tables) {
            let columns: Vec<String> = definitions
                .get(table)
                .and_then(|d| d.get("properties"))
                .and_then(Value::as_object)
                .map(|p| p.keys().cloned().collect())
                .unwrap_or_default();
            total_columns += columns.len();

            let path = format!("/{}?select=*&limit=0", table);
            let row_count = match self.get(creds, &path, Some("count=exact")) {
                Ok(resp) => resp.header("content-range").and_then(parse_content_range_total),
                Err(ProbeError::Permission(_)) => {
                    warnings.push(format!("table {}: row count not readable with this key", table));
                    None
                }
                Err(e) => {
                    warnings.push(format!("table {}: {}", table, e));
                    None
                }
            };
            schemas.insert(
                table.clone(),
                json!({
                    "columns": columns,
                    "column_count": columns.len(),
                    "row_count": row_count,
                }),
            );
        }

        let mut facts = Facts::new();
        facts.insert("tables_inspected".into(), json!(schemas.len()));
        facts.insert("total_columns".into(), json!(total_columns));
        facts.insert("schemas".into(), Value::Object(schemas));
        Ok(ProbeOutcome::with_warnings(facts, warnings))
    }

    fn openapi(&self, creds: &Credentials) -> Result<Value, ProbeError> {
        let response = self.get(creds, "/", None)?;
        Ok(serde_json::from_str(&response.body)?)
    }
}

impl Probe for DatabaseProbe {
    fn kind(&self) -> TargetKind {
        TargetKind::Database
    }

    fn max_level(&self) -> u8 {
        3
    }

    fn level_name(&self, level: u8) -> &'static str {
        match level {
            1 => "connection",
            2 => "tables",
            3 => "schema",
            _ => "unknown",
        }
    }

    fn invoke(
        &self,
        target: &Target,
        level: u8,
        so_far: &LadderResult,
    ) -> Result<ProbeOutcome, ProbeError> {
        let creds = self.credentials(target)?;
        match level {
            1 => self.connection(&creds),
            2 => self.tables(&creds),
            3 => self.schema(&creds, so_far),
            other => Err(ProbeError::Malformed(format!("database probe has no level {}", other))),
        }
    }

    /// `table/<name>` per table. With level 3 the fingerprint covers the
    /// column list; otherwise only the table's presence is tracked.
    fn entities(&self, result: &LadderResult) -> BTreeMap<String, EntityRecord> {
        let mut entities = BTreeMap::new();
        if let Some(tables) = result
            .facts(2)
            .and_then(|f| f.get("tables"))
            .and_then(Value::as_array)
        {
            for name in tables.iter().filter_map(Value::as_str) {
                entities.insert(
                    format!("table/{}", name),
                    EntityRecord::from_fields(&json!({ "table": name })),
                );
            }
        }
        if let Some(schemas) = result
            .facts(3)
            .and_then(|f| f.get("schemas"))
            .and_then(Value::as_object)
        {
            for (name, schema) in schemas {
                let fingerprint =
                    snapshot::fingerprint_value(&json!({ "table": name, "columns": schema["columns"] }));
                let mut record = EntityRecord::new(fingerprint, 0)
                    .with_metadata("column_count", schema["column_count"].clone());
                if let Some(rows) = schema["row_count"].as_i64() {
                    record = record.with_metadata("row_count", rows);
                }
                entities.insert(format!("table/{}", name), record);
            }
        }
        entities
    }
}

/// A curl config file (`-K`) with one `header` line per entry.
fn curl_header_config(headers: &[String]) -> String {
    headers
        .iter()
        .map(|h| {
            let escaped = h
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "")
                .replace('\r', "");
            format!("header = \"{}\"\n", escaped)
        })
        .collect()
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Table definitions from an OpenAPI (swagger 2) document.
fn table_definitions(doc: &Value) -> Map<String, Value> {
    doc.get("definitions")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Split `curl -D -` output into status, headers and body. When curl saw
/// interim responses (`100 Continue`), the last header block wins.
pub fn parse_http_response(raw: &str) -> Result<HttpResponse, ProbeError> {
    let normalized = raw.replace("\r\n", "\n");
    let mut rest = normalized.as_str();
    loop {
        let (head, body) = rest
            .split_once("\n\n")
            .unwrap_or((rest, ""));
        let mut lines = head.lines();
        let status_line = lines.next().unwrap_or("");
        if !status_line.starts_with("HTTP/") {
            return Err(ProbeError::Malformed(format!(
                "no HTTP status line in response: {}",
                status_line.chars().take(80).collect::<String>()
            )));
        }
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| ProbeError::Malformed(format!("bad status line '{}'", status_line)))?;
        if (100..200).contains(&status) && body.starts_with("HTTP/") {
            rest = body;
            continue;
        }
        let headers = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        return Ok(HttpResponse {
            status,
            headers,
            body: body.to_string(),
        });
    }
}

/// Total from a `Content-Range` value such as `0-24/3573` or `*/0`.
fn parse_content_range_total(value: &str) -> Option<i64> {
    value.rsplit('/').next()?.trim().parse().ok()
}
