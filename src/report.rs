use crate::{
    analysis::FullAnalysis,
    config::Settings,
    item::tag_labels,
};
use std::fmt::Write as _;

const STYLE: &str = "body { font-family: -apple-system, \"Segoe UI\", sans-serif; margin: 0; background: #f4f7f6; color: #333; }
.container { max-width: 1200px; margin: 20px auto; padding: 20px; background: #fff; border-radius: 8px; box-shadow: 0 2px 8px rgba(0,0,0,0.1); }
h1, h2 { color: #2c3e50; border-bottom: 2px solid #e0e0e0; padding-bottom: 10px; }
h1 { text-align: center; }
table { width: 100%; border-collapse: collapse; margin-top: 20px; }
th, td { padding: 10px; border: 1px solid #ddd; text-align: left; }
th { background: #3498db; color: #fff; }
.tag { display: inline-block; padding: 2px 6px; margin-left: 5px; font-size: 0.8em; border-radius: 4px; color: #fff; }
.tag-vr { background: #9b59b6; }
.tag-optional { background: #f39c12; }
.tag-recommended { background: #2ecc71; }
.missing { background: #ffebee; }
.order-problem { background: #fff9c4; }
.cycle-break { color: #e67e22; font-weight: bold; }
a { color: #2980b9; text-decoration: none; }
footer { text-align: center; margin-top: 20px; font-size: 0.9em; color: #7f8c8d; }";

/// Standalone HTML page with the missing requirements, load order violations
/// and recommended order of one analysis.
pub fn render_html(analysis: &FullAnalysis, settings: &Settings) -> String {
    let mut out = String::new();
    let link = |id: &str, text: &str| {
        format!(
            "<a href=\"{}\" target=\"_blank\">{}</a>",
            escape(&settings.item_page_url(id)),
            escape(text)
        )
    };

    out.push_str("<!DOCTYPE html>\n<html lang=\"en\"><head><meta charset=\"UTF-8\">");
    out.push_str("<title>Dependency report</title>");
    let _ = writeln!(out, "<style>{STYLE}</style></head><body><div class=\"container\">");
    out.push_str("<h1>Dependency report</h1>\n");
    let _ = writeln!(
        out,
        "<p><strong>Game:</strong> {}<br><strong>Generated:</strong> {}</p>",
        escape(&settings.game_name),
        escape(&analysis.created_at)
    );

    if !analysis.missing.is_empty() {
        out.push_str("<h2>Missing requirements</h2>\n<table><tr><th>Missing item</th><th>ID</th><th>Required by</th></tr>\n");
        for report in analysis.missing.values() {
            let mut needed_by = String::from("<ul>");
            for requirer in &report.required_by_installed {
                let notes = if requirer.notes.is_empty() {
                    "no notes"
                } else {
                    requirer.notes.as_str()
                };
                let _ = write!(needed_by, "<li>{} ({})", escape(&requirer.folder), escape(notes));
                for label in tag_labels(&requirer.tags) {
                    let _ = write!(needed_by, "<span class=\"tag tag-{label}\">{label}</span>");
                }
                needed_by.push_str("</li>");
            }
            for requirer in &report.required_by_missing {
                let _ = write!(needed_by, "<li>missing {}</li>", link(&requirer.id, &requirer.name));
            }
            needed_by.push_str("</ul>");
            let _ = writeln!(
                out,
                "<tr class=\"missing\"><td>{}</td><td>{}</td><td>{needed_by}</td></tr>",
                link(&report.id, &report.name),
                escape(&report.id)
            );
        }
        out.push_str("</table>\n");
    }

    if let Some(violations) = analysis.violations.as_ref().filter(|v| !v.is_empty()) {
        out.push_str("<h2>Load order problems</h2>\n<table><tr><th>Mod</th><th>Problem</th><th>Separator</th></tr>\n");
        for violation in violations {
            let _ = writeln!(
                out,
                "<tr class=\"order-problem\"><td>{}</td><td>should load after <strong>{}</strong></td><td>{}</td></tr>",
                link(&violation.dependent_id, &violation.dependent),
                escape(&violation.provider),
                escape(&violation.separator)
            );
        }
        out.push_str("</table>\n");
    }

    if !analysis.sorted.order.is_empty() {
        out.push_str("<h2>Recommended load order</h2>\n<table><tr><th>#</th><th>Folder</th><th>ID</th><th>Note</th></tr>\n");
        for (index, folder) in analysis.sorted.order.iter().enumerate() {
            let id = analysis
                .folder_ids
                .get(folder)
                .map(|id| link(id, id))
                .unwrap_or_else(|| "N/A".to_string());
            let note = if analysis.sorted.cycle_breaks.contains(folder) {
                "<span class=\"cycle-break\">cycle break</span>"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "<tr><td>{}</td><td>{}</td><td>{id}</td><td>{note}</td></tr>",
                index + 1,
                escape(folder)
            );
        }
        out.push_str("</table>\n");
    }

    out.push_str("<footer>Generated by modorder</footer></div></body></html>\n");
    out
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::run_full,
        rules::RuleSet,
        testing::{context, item, item_with_notes, store},
    };

    #[test]
    fn report_covers_every_section() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(
            dir.path(),
            vec![
                item("1", "Base", "Default", &[]),
                item_with_notes("2", "Addon <VR>", "Default", &[("1", ""), ("999", "VR only")]),
            ],
        );
        let ctx = context(&[("Addon & Co", "2"), ("Base", "1")], RuleSet::default());
        let analysis = run_full(&ctx, &store, true).unwrap().completed().unwrap();
        let html = render_html(&analysis, &ctx.settings);

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<h2>Missing requirements</h2>"));
        assert!(html.contains("Addon &amp; Co (VR only)<span class=\"tag tag-vr\">vr</span>"));
        assert!(html.contains("<h2>Load order problems</h2>"));
        assert!(html.contains("should load after <strong>Base</strong>"));
        assert!(html.contains("<h2>Recommended load order</h2>"));
        assert!(html.contains(&format!(
            "<a href=\"{}\" target=\"_blank\">1</a>",
            ctx.settings.item_page_url("1")
        )));
        assert!(!html.contains("cycle-break\">"));
    }

    #[test]
    fn cycle_breaks_are_marked() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(
            dir.path(),
            vec![item("1", "A", "Default", &["2"]), item("2", "B", "Default", &["1"])],
        );
        let ctx = context(&[("A", "1"), ("B", "2")], RuleSet::default());
        let analysis = run_full(&ctx, &store, false).unwrap().completed().unwrap();
        let html = render_html(&analysis, &ctx.settings);
        assert!(html.contains("<span class=\"cycle-break\">cycle break</span>"));
        assert!(!html.contains("Load order problems"));
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("<a href='x'>&\"</a>"), "&lt;a href=&#39;x&#39;&gt;&amp;&quot;&lt;/a&gt;");
    }
}
