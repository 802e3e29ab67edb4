//! Flatten stored profiles and their typing documents into CSV or JSON for
//! downstream analysis.
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::Value;
use sqlx::Row as _;
use std::path::Path;
use tracing::{info, warn};

use super::db::Db;
use super::documents::{read_json, DocumentDir};
use crate::pdb::models::{ProfileId, TypingBreakdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportLayout {
    /// One row per (profile, system, personality type) with its vote count.
    Votes,
    /// One row per profile with a `system_<id>` column holding the top-voted type.
    Leading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub layout: ExportLayout,
    pub format: ExportFormat,
    /// Embed `{id}_wiki.json` (when present) in a `wiki` column.
    pub include_wiki: bool,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportStats {
    pub profiles: usize,
    pub rows: usize,
    pub missing_typing: usize,
}

type ExportRow = IndexMap<String, Value>;

pub async fn export_profiles(
    db: &Db,
    docs: &DocumentDir,
    out: &Path,
    opts: &ExportOptions,
) -> Result<ExportStats> {
    let profiles = sqlx::query(
        "SELECT id, mbti_profile, wiki_description, sub_cat_id, cat_id, property_id, total_vote_counts \
         FROM profiles ORDER BY id LIMIT ?1",
    )
    .bind(opts.limit.unwrap_or(-1))
    .fetch_all(&db.pool)
    .await
    .context("failed to read profiles")?;

    let mut stats = ExportStats::default();
    let mut rows: Vec<ExportRow> = Vec::new();

    for profile in profiles {
        stats.profiles += 1;
        let id = ProfileId(profile.get::<i64, _>("id"));
        let mut base = ExportRow::new();
        base.insert("id".into(), Value::from(id.get()));
        for col in ["mbti_profile", "wiki_description"] {
            let v: Option<String> = profile.get(col);
            base.insert(col.into(), v.map(Value::from).unwrap_or(Value::Null));
        }
        for col in ["sub_cat_id", "cat_id", "property_id", "total_vote_counts"] {
            let v: Option<i64> = profile.get(col);
            base.insert(col.into(), v.map(Value::from).unwrap_or(Value::Null));
        }
        if opts.include_wiki {
            let wiki = read_json::<Value>(&docs.wiki_path(id)).await.unwrap_or(Value::Null);
            base.insert("wiki".into(), wiki);
        }

        let typing = match read_json::<TypingBreakdown>(&docs.typing_path(id)).await {
            Ok(t) => t,
            Err(err) => {
                warn!(profile_id = %id, error = %err, "typing document unavailable; skipping profile");
                stats.missing_typing += 1;
                continue;
            }
        };

        match opts.layout {
            ExportLayout::Votes => {
                for (system_id, votes) in &typing.breakdown_systems {
                    for vote in votes {
                        let mut row = base.clone();
                        row.insert("system_id".into(), Value::from(system_id.as_str()));
                        row.insert("personality_type".into(), Value::from(vote.personality_type.as_str()));
                        row.insert("vote_count".into(), Value::from(vote.vote_count));
                        rows.push(row);
                    }
                }
            }
            ExportLayout::Leading => {
                let mut row = base;
                let leading = typing.leading_types();
                for system_id in typing.breakdown_systems.keys() {
                    let label = leading
                        .get(system_id.as_str())
                        .map(|v| v.personality_type.as_str())
                        .unwrap_or("");
                    row.insert(format!("system_{system_id}"), Value::from(label));
                }
                rows.push(row);
            }
        }
    }

    stats.rows = rows.len();
    match opts.format {
        ExportFormat::Csv => write_csv(out, &rows)?,
        ExportFormat::Json => {
            let body = serde_json::to_vec_pretty(&rows)?;
            std::fs::write(out, body).with_context(|| format!("failed to write {}", out.display()))?;
        }
    }
    info!(path = %out.display(), profiles = stats.profiles, rows = stats.rows, missing_typing = stats.missing_typing, "export written");
    Ok(stats)
}

/// Header is the union of all row keys; `system_*` columns sorted by numeric id.
fn columns(rows: &[ExportRow]) -> Vec<String> {
    let mut fixed: Vec<String> = Vec::new();
    let mut systems: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            let bucket = if key.starts_with("system_") && key != "system_id" {
                &mut systems
            } else {
                &mut fixed
            };
            if !bucket.contains(key) {
                bucket.push(key.clone());
            }
        }
    }
    systems.sort_by_key(|k| {
        let suffix = k.trim_start_matches("system_");
        (suffix.parse::<i64>().unwrap_or(i64::MAX), suffix.to_string())
    });
    fixed.extend(systems);
    fixed
}

fn cell(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn write_csv(out: &Path, rows: &[ExportRow]) -> Result<()> {
    let header = columns(rows);
    let mut wtr = csv::Writer::from_path(out)
        .with_context(|| format!("failed to create {}", out.display()))?;
    wtr.write_record(&header)?;
    for row in rows {
        wtr.write_record(header.iter().map(|col| cell(row.get(col))))?;
    }
    wtr.flush()?;
    Ok(())
}
