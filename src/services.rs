//! Dashboard HTTP surface.
//!
//! Requests are served one at a time from a single loop, so report
//! submissions through the dashboard never interleave.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Read;

use serde::Serialize;
use tiny_http::{Header, Method, Response, Server};
use tracing::{debug, error, info};
use url::form_urlencoded;

use crate::{
    area_trend, escape_html, format_percent, store_trend, AliasTable, MaskDb, MaskError,
    RecordFilter, ReportFormat, Result, StoreKind, StoreRegistry, TrendResponse,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HttpReply {
    pub(crate) status: u16,
    pub(crate) content_type: &'static str,
    pub(crate) body: String,
}

impl HttpReply {
    fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            status: 200,
            content_type: "application/json; charset=utf-8",
            body: serde_json::to_string(value)?,
        })
    }

    fn html(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body,
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "application/json; charset=utf-8",
            body: serde_json::json!({ "error": "not found" }).to_string(),
        }
    }

    fn from_error(err: &MaskError) -> Self {
        let status = match err {
            MaskError::StoreNotFound(_)
            | MaskError::RecordNotFound(_)
            | MaskError::CommentNotFound(_) => 404,
            MaskError::InvalidInput(_)
            | MaskError::EmptyReport
            | MaskError::Csv { .. }
            | MaskError::DuplicateStore(_) => 400,
            _ => 500,
        };
        Self {
            status,
            content_type: "application/json; charset=utf-8",
            body: serde_json::json!({ "error": err.to_string() }).to_string(),
        }
    }
}

pub(crate) struct Dashboard {
    db: MaskDb,
    aliases: AliasTable,
    format: ReportFormat,
}

impl Dashboard {
    pub(crate) fn new(db: MaskDb, aliases: AliasTable, format: ReportFormat) -> Self {
        Self { db, aliases, format }
    }

    pub(crate) fn handle(&self, method: &Method, url: &str, body: &str) -> HttpReply {
        let (path, query) = url.split_once('?').unwrap_or((url, ""));
        let params: HashMap<String, String> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        match self.route(method, path, &params, body) {
            Ok(reply) => reply,
            Err(err) => {
                error!(%path, error = %err, "request failed");
                HttpReply::from_error(&err)
            }
        }
    }

    fn route(
        &self,
        method: &Method,
        path: &str,
        params: &HashMap<String, String>,
        body: &str,
    ) -> Result<HttpReply> {
        match (method, path) {
            (Method::Get, "/") => Ok(HttpReply::html(self.overview_page(None)?)),
            (Method::Post, "/ingest") => {
                let form: HashMap<String, String> = form_urlencoded::parse(body.as_bytes())
                    .into_owned()
                    .collect();
                let text = form.get("report").map(String::as_str).unwrap_or("");
                let lines = match self.db.ingest_report(text, &self.aliases, &self.format) {
                    Ok(report) => {
                        let mut lines: Vec<String> =
                            report.outcomes.iter().map(|o| o.to_string()).collect();
                        if report.outcomes.is_empty() {
                            lines.push("対象店舗のデータが見つかりませんでした。".to_string());
                        }
                        if report.previous_run.is_some() {
                            lines.push("同じ本文が以前にも登録されています。".to_string());
                        }
                        lines
                    }
                    Err(MaskError::EmptyReport) => {
                        vec!["データが入力されていません。".to_string()]
                    }
                    Err(err) => return Err(err),
                };
                Ok(HttpReply::html(self.overview_page(Some(&lines))?))
            }
            (Method::Post, "/api/ingest") => {
                let report = self.db.ingest_report(body, &self.aliases, &self.format)?;
                HttpReply::json(&report)
            }
            (Method::Get, "/api/stores") => HttpReply::json(&self.db.list_stores()?),
            (Method::Get, "/api/areas") => HttpReply::json(&self.db.areas()?),
            (Method::Get, "/api/records") => {
                let filter = RecordFilter {
                    store: params.get("store").cloned(),
                    unresolved_only: params.get("unresolved").is_some_and(|v| v == "1" || v == "true"),
                    ..RecordFilter::default()
                };
                HttpReply::json(&self.db.query_records(&filter)?)
            }
            (Method::Get, "/api/trend") => {
                let range = self.db.chart_range()?;
                let response = if let Some(store) = params.get("store") {
                    TrendResponse {
                        label: store.clone(),
                        range,
                        points: store_trend(&self.db, store)?,
                    }
                } else if let Some(area) = params.get("area") {
                    let kind = params
                        .get("kind")
                        .map(|k| k.parse::<StoreKind>())
                        .transpose()?;
                    TrendResponse {
                        label: area.clone(),
                        range,
                        points: area_trend(&self.db, area, kind)?,
                    }
                } else {
                    return Err(MaskError::InvalidInput(
                        "trend needs a store or area parameter".to_string(),
                    ));
                };
                HttpReply::json(&response)
            }
            (Method::Get, "/api/comments") => HttpReply::json(&self.db.list_comments()?),
            (Method::Get, "/api/chart-range") => HttpReply::json(&self.db.chart_range()?),
            (Method::Get, "/api/runs") => HttpReply::json(&self.db.recent_ingest_runs(20)?),
            _ => Ok(HttpReply::not_found()),
        }
    }

    fn overview_page(&self, messages: Option<&[String]>) -> Result<String> {
        let stores = self.db.list_stores()?;
        let unresolved = self.db.query_records(&RecordFilter {
            unresolved_only: true,
            ..RecordFilter::default()
        })?;
        let latest = self.db.query_records(&RecordFilter::default())?;
        let comments = self.db.list_comments()?;

        let mut html = String::new();
        html.push_str("<!doctype html><html lang=\"ja\"><head><meta charset=\"utf-8\"><title>マスク着用率</title></head><body>\n");
        html.push_str("<h1>マスク着用率ダッシュボード</h1>\n");

        if let Some(messages) = messages {
            html.push_str("<section><h2>登録結果</h2><ul>\n");
            for line in messages {
                let _ = writeln!(html, "<li>{}</li>", escape_html(line));
            }
            html.push_str("</ul></section>\n");
        }

        html.push_str("<section><h2>稼働データ登録</h2>\n<form method=\"post\" action=\"/ingest\">\n<textarea name=\"report\" rows=\"20\" cols=\"60\"></textarea><br>\n<button type=\"submit\">登録処理を開始</button>\n</form></section>\n");

        html.push_str("<section><h2>店舗一覧</h2><table>\n<tr><th>ID</th><th>店舗名</th><th>地区</th><th>種別</th><th>未登録</th></tr>\n");
        for store in &stores {
            let pending = unresolved.iter().filter(|r| r.store_id == store.id).count();
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                store.id,
                escape_html(&store.name),
                escape_html(&store.area),
                store.kind,
                pending
            );
        }
        html.push_str("</table></section>\n");

        html.push_str("<section><h2>最新データ</h2><table>\n<tr><th>日付</th><th>店舗</th><th>P着用率</th><th>S着用率</th><th>全体</th></tr>\n");
        for record in latest.iter().take(50) {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                record.date,
                escape_html(&record.store_name),
                format_percent(record.rates.pachinko),
                format_percent(record.rates.slot),
                format_percent(record.rates.total)
            );
        }
        html.push_str("</table></section>\n");

        html.push_str("<section><h2>コメント</h2><ul>\n");
        for comment in &comments {
            let _ = writeln!(
                html,
                "<li>{}年{}月：{}</li>",
                comment.year,
                comment.month,
                escape_html(&comment.comment)
            );
        }
        html.push_str("</ul></section>\n</body></html>\n");
        Ok(html)
    }
}

pub(crate) fn run_dashboard(dashboard: Dashboard, bind: &str, port: u16) -> Result<()> {
    let addr = format!("{bind}:{port}");
    let server = Server::http(&addr).map_err(|e| MaskError::Server(format!("{addr}: {e}")))?;
    info!("dashboard listening on http://{addr}");

    for mut request in server.incoming_requests() {
        let method = request.method().clone();
        let url = request.url().to_string();
        let mut body = String::new();
        let reply = match request.as_reader().read_to_string(&mut body) {
            Ok(_) => dashboard.handle(&method, &url, &body),
            Err(e) => HttpReply::from_error(&MaskError::InvalidInput(format!("read body: {e}"))),
        };
        debug!(%method, %url, status = reply.status, "request served");

        let header = Header::from_bytes("Content-Type", reply.content_type)
            .map_err(|_| MaskError::Server("invalid header".to_string()))?;
        let response = Response::from_string(reply.body)
            .with_status_code(reply.status)
            .with_header(header);
        let _ = request.respond(response);
    }
    Ok(())
}
