use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::info;

use crate::AppResult;
use crate::store::{CLUSTER_NOISE, ClusterRow, ScatterPoint, Store};

static REPORT_TEMPLATE: &str = std::include_str!("report_template.html");

/// Feedback shown in hover text and markdown samples is clipped to this.
const EXCERPT_CHARS: usize = 200;

/// Everything the renderer reads. Loaded from the store in one pass so the
/// rendering itself stays a pure function with no database or remote access.
#[derive(Debug, Clone)]
pub struct ReportSnapshot {
    pub points: Vec<ScatterPoint>,
    pub clusters: Vec<ClusterRow>,
    pub crosstab: Vec<(String, i64, i64)>,
    pub embedded_total: i64,
    pub noise_count: i64,
}

impl ReportSnapshot {
    pub async fn load(store: &Store) -> AppResult<Self> {
        let (_, noise_count) = store.assignment_counts().await?;
        Ok(Self {
            points: store.scatter_points().await?,
            clusters: store.clusters_overview().await?,
            crosstab: store.program_crosstab().await?,
            embedded_total: store.embedded_count().await?,
            noise_count,
        })
    }
}

fn excerpt(text: &str) -> String {
    let mut clipped: String = text.chars().take(EXCERPT_CHARS).collect();
    if clipped.len() < text.len() {
        clipped.push_str("...");
    }
    clipped
}

fn trace_name(cluster: Option<&ClusterRow>, cluster_id: i64, size: usize) -> String {
    let title = cluster
        .and_then(|c| c.description.as_deref())
        .and_then(|d| d.lines().next())
        .map(|line| excerpt(line.trim()))
        .unwrap_or_default();
    if title.is_empty() {
        format!("Cluster {cluster_id} ({size})")
    } else {
        format!("Cluster {cluster_id}: {title} ({size})")
    }
}

/// Scatter figure of the 2D projection: one trace per cluster, plus a muted
/// trace for unassigned points rendered only when any exist.
pub fn build_scatter_payload(snapshot: &ReportSnapshot) -> Value {
    let mut by_cluster: BTreeMap<i64, Vec<&ScatterPoint>> = BTreeMap::new();
    for point in &snapshot.points {
        by_cluster.entry(point.cluster_id).or_default().push(point);
    }

    let mut traces = Vec::new();
    for (&cluster_id, points) in &by_cluster {
        if cluster_id == CLUSTER_NOISE {
            continue;
        }
        let cluster = snapshot
            .clusters
            .iter()
            .find(|c| c.cluster_id == cluster_id);
        traces.push(json!({
            "type": "scatter",
            "mode": "markers",
            "name": trace_name(cluster, cluster_id, points.len()),
            "x": points.iter().map(|p| p.x).collect::<Vec<f64>>(),
            "y": points.iter().map(|p| p.y).collect::<Vec<f64>>(),
            "text": points
                .iter()
                .map(|p| format!("{}: {}", p.program_name, excerpt(&p.feedback)))
                .collect::<Vec<String>>(),
            "hoverinfo": "text",
            "marker": { "size": 8, "opacity": 0.7, "line": { "width": 1, "color": "white" } },
        }));
    }

    if let Some(noise) = by_cluster.get(&CLUSTER_NOISE) {
        traces.push(json!({
            "type": "scatter",
            "mode": "markers",
            "name": format!("Unassigned ({})", noise.len()),
            "x": noise.iter().map(|p| p.x).collect::<Vec<f64>>(),
            "y": noise.iter().map(|p| p.y).collect::<Vec<f64>>(),
            "text": noise
                .iter()
                .map(|p| format!("{}: {}", p.program_name, excerpt(&p.feedback)))
                .collect::<Vec<String>>(),
            "hoverinfo": "text",
            "marker": { "size": 4, "color": "lightgray" },
        }));
    }

    json!({
        "data": traces,
        "layout": {
            "title": { "text": format!("Feedback clusters ({} entries)", snapshot.points.len()) },
            "showlegend": true,
            // Projection axes carry no meaning; hide them entirely.
            "xaxis": { "visible": false },
            "yaxis": { "visible": false },
            "plot_bgcolor": "white",
            "paper_bgcolor": "white",
        },
    })
}

/// Bar figure of live cluster sizes with percentage-of-total annotations.
pub fn build_sizes_payload(snapshot: &ReportSnapshot) -> Value {
    let denominator = snapshot.embedded_total.max(1) as f64;
    let mut clusters: Vec<&ClusterRow> = snapshot.clusters.iter().collect();
    clusters.sort_by_key(|c| c.cluster_id);

    let labels: Vec<String> = clusters
        .iter()
        .map(|c| format!("Cluster {}", c.cluster_id))
        .collect();
    let sizes: Vec<i64> = clusters.iter().map(|c| c.size).collect();
    let annotations: Vec<String> = clusters
        .iter()
        .map(|c| format!("{} ({:.1}%)", c.size, c.size as f64 / denominator * 100.0))
        .collect();

    json!({
        "data": [{
            "type": "bar",
            "x": labels,
            "y": sizes,
            "text": annotations,
            "textposition": "auto",
        }],
        "layout": {
            "title": { "text": format!("Cluster sizes (total: {} entries)", snapshot.embedded_total) },
            "xaxis": { "title": { "text": "Cluster" } },
            "yaxis": { "title": { "text": "Number of feedback entries" } },
            "showlegend": false,
        },
    })
}

/// Program-label x cluster crosstab as a dense count matrix.
pub fn build_crosstab_payload(snapshot: &ReportSnapshot) -> Value {
    let mut programs: Vec<String> = snapshot
        .crosstab
        .iter()
        .map(|(program, _, _)| program.clone())
        .collect();
    programs.sort();
    programs.dedup();

    let mut cluster_ids: Vec<i64> = snapshot
        .crosstab
        .iter()
        .map(|&(_, cluster_id, _)| cluster_id)
        .collect();
    cluster_ids.sort_unstable();
    cluster_ids.dedup();

    let mut counts = vec![vec![0i64; cluster_ids.len()]; programs.len()];
    for (program, cluster_id, count) in &snapshot.crosstab {
        let row = programs.iter().position(|p| p == program).unwrap();
        let col = cluster_ids.iter().position(|c| c == cluster_id).unwrap();
        counts[row][col] = *count;
    }

    json!({
        "programs": programs,
        "clusters": cluster_ids,
        "counts": counts,
    })
}

/// Narrative markdown report: summary statistics plus one section per
/// cluster with its description, representative samples, and top programs.
pub fn build_markdown_report(snapshot: &ReportSnapshot) -> AppResult<String> {
    let mut out = String::new();
    let date_format = format_description!("[year]-[month]-[day] [hour]:[minute]");

    writeln!(out, "# Feedback Cluster Analysis Report\n")?;
    writeln!(
        out,
        "**Analysis Date:** {}\n",
        OffsetDateTime::now_utc().format(&date_format)?
    )?;

    writeln!(out, "## Summary Statistics\n")?;
    writeln!(
        out,
        "- **Total Feedback Entries Analyzed:** {}",
        snapshot.embedded_total
    )?;
    writeln!(
        out,
        "- **Number of Clusters Found:** {}",
        snapshot.clusters.len()
    )?;
    let noise_pct = if snapshot.embedded_total > 0 {
        snapshot.noise_count as f64 / snapshot.embedded_total as f64 * 100.0
    } else {
        0.0
    };
    writeln!(
        out,
        "- **Unassigned Points:** {} ({:.1}%)\n",
        snapshot.noise_count, noise_pct
    )?;

    writeln!(out, "## Detailed Cluster Analysis\n")?;

    let mut clusters: Vec<&ClusterRow> = snapshot.clusters.iter().collect();
    clusters.sort_by(|a, b| b.size.cmp(&a.size));

    for cluster in clusters {
        writeln!(
            out,
            "### Cluster {} (Size: {})\n",
            cluster.cluster_id, cluster.size
        )?;
        match cluster.description.as_deref() {
            Some(description) => writeln!(out, "{description}\n")?,
            None => writeln!(out, "_No description available._\n")?,
        }

        if !cluster.representative_samples.is_empty() {
            writeln!(out, "**Sample Feedback:**\n")?;
            for (i, sample) in cluster.representative_samples.iter().enumerate() {
                writeln!(out, "{}. \"{}\"\n", i + 1, excerpt(sample))?;
            }
        }

        let mut programs: Vec<(&String, i64)> = snapshot
            .crosstab
            .iter()
            .filter(|&&(_, cluster_id, _)| cluster_id == cluster.cluster_id)
            .map(|(program, _, count)| (program, *count))
            .collect();
        programs.sort_by(|a, b| b.1.cmp(&a.1));
        if !programs.is_empty() {
            writeln!(out, "**Top Programs in this Cluster:**")?;
            for (program, count) in programs.into_iter().take(5) {
                writeln!(out, "- {program}: {count} entries")?;
            }
            writeln!(out)?;
        }

        writeln!(out, "---\n")?;
    }

    Ok(out)
}

/// Interactive HTML: the chart payloads embedded into a static template.
pub fn render_html(scatter: &Value, sizes: &Value) -> AppResult<String> {
    Ok(REPORT_TEMPLATE
        .replace("__SCATTER_JSON__", &serde_json::to_string(scatter)?)
        .replace("__SIZES_JSON__", &serde_json::to_string(sizes)?))
}

#[derive(Debug, Clone)]
pub struct ReportSummary {
    pub files: Vec<PathBuf>,
}

/// Render every artifact from the current store snapshot into `out_dir`.
#[tracing::instrument(name = "Rendering reports", level = "info", skip(store))]
pub async fn run_report_stage<P: AsRef<Path> + std::fmt::Debug>(
    store: &Store,
    out_dir: P,
) -> AppResult<ReportSummary> {
    let snapshot = ReportSnapshot::load(store).await?;
    let out_dir = out_dir.as_ref();
    fs::create_dir_all(out_dir)?;

    let scatter = build_scatter_payload(&snapshot);
    let sizes = build_sizes_payload(&snapshot);
    let crosstab = build_crosstab_payload(&snapshot);
    let markdown = build_markdown_report(&snapshot)?;
    let html = render_html(&scatter, &sizes)?;

    let outputs = [
        ("cluster_scatter.json", serde_json::to_string_pretty(&scatter)?),
        ("cluster_sizes.json", serde_json::to_string_pretty(&sizes)?),
        (
            "program_crosstab.json",
            serde_json::to_string_pretty(&crosstab)?,
        ),
        ("cluster_report.md", markdown),
        ("cluster_report.html", html),
    ];

    let mut files = Vec::with_capacity(outputs.len());
    for (name, content) in outputs {
        let path = out_dir.join(name);
        fs::write(&path, content)?;
        files.push(path);
    }

    info!("Wrote {} report files to {}", files.len(), out_dir.display());
    Ok(ReportSummary { files })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(cluster_id: i64, x: f64, y: f64) -> ScatterPoint {
        ScatterPoint {
            cluster_id,
            x,
            y,
            program_name: "Chicago".to_string(),
            feedback: "some feedback".to_string(),
        }
    }

    fn cluster(cluster_id: i64, size: i64, description: Option<&str>) -> ClusterRow {
        ClusterRow {
            cluster_id,
            size,
            description: description.map(str::to_string),
            representative_samples: vec!["a representative comment".to_string()],
        }
    }

    fn snapshot_with_noise(noise_points: usize) -> ReportSnapshot {
        let mut points = vec![point(0, 0.0, 0.0), point(0, 0.1, 0.1), point(3, 5.0, 5.0)];
        for i in 0..noise_points {
            points.push(point(CLUSTER_NOISE, 20.0 + i as f64, 20.0));
        }
        ReportSnapshot {
            points,
            clusters: vec![
                cluster(0, 2, Some("Parking complaints.\nTone: negative")),
                cluster(3, 1, None),
            ],
            crosstab: vec![
                ("Chicago".to_string(), 0, 2),
                ("Chicago".to_string(), 3, 1),
            ],
            embedded_total: 3 + noise_points as i64,
            noise_count: noise_points as i64,
        }
    }

    fn trace_names(payload: &Value) -> Vec<String> {
        payload["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn zero_noise_means_no_unassigned_trace() {
        let payload = build_scatter_payload(&snapshot_with_noise(0));
        let names = trace_names(&payload);
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.contains("Unassigned")));
    }

    #[test]
    fn noise_points_get_their_own_muted_trace() {
        let payload = build_scatter_payload(&snapshot_with_noise(4));
        let names = trace_names(&payload);
        assert!(names.iter().any(|n| n.starts_with("Unassigned (4)")));
        let noise_trace = payload["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["name"].as_str().unwrap().starts_with("Unassigned"))
            .unwrap();
        assert_eq!(noise_trace["marker"]["color"], "lightgray");
    }

    #[test]
    fn non_contiguous_cluster_ids_are_tolerated() {
        let payload = build_scatter_payload(&snapshot_with_noise(0));
        let names = trace_names(&payload);
        assert!(names.iter().any(|n| n.starts_with("Cluster 3")));
    }

    #[test]
    fn sizes_payload_annotates_percentages() {
        let snapshot = snapshot_with_noise(0);
        let payload = build_sizes_payload(&snapshot);
        let texts = payload["data"][0]["text"].as_array().unwrap();
        assert_eq!(texts[0].as_str().unwrap(), "2 (66.7%)");
    }

    #[test]
    fn markdown_handles_missing_descriptions() {
        let markdown = build_markdown_report(&snapshot_with_noise(2)).unwrap();
        assert!(markdown.contains("### Cluster 3 (Size: 1)"));
        assert!(markdown.contains("_No description available._"));
        assert!(markdown.contains("**Unassigned Points:** 2"));
    }

    #[test]
    fn crosstab_builds_a_dense_matrix() {
        let payload = build_crosstab_payload(&snapshot_with_noise(0));
        assert_eq!(payload["programs"], json!(["Chicago"]));
        assert_eq!(payload["clusters"], json!([0, 3]));
        assert_eq!(payload["counts"], json!([[2, 1]]));
    }

    #[test]
    fn empty_snapshot_still_renders() {
        let snapshot = ReportSnapshot {
            points: vec![],
            clusters: vec![],
            crosstab: vec![],
            embedded_total: 0,
            noise_count: 0,
        };
        let scatter = build_scatter_payload(&snapshot);
        assert_eq!(scatter["data"].as_array().unwrap().len(), 0);
        let markdown = build_markdown_report(&snapshot).unwrap();
        assert!(markdown.contains("**Total Feedback Entries Analyzed:** 0"));
        render_html(&scatter, &build_sizes_payload(&snapshot)).unwrap();
    }
}
