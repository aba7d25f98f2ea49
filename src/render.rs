//! HTML status page for a snapshot.

use std::fmt::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::blobstore::DirBlobStore;
use crate::types::{BlobRef, ProxyGroup, Screenshot, Snapshot, TestOutcome};

/// Maps a stored artifact to the href a viewer should follow.
pub type LinkFn<'a> = &'a dyn Fn(&BlobRef) -> String;

/// Seconds between automatic reloads while a run is in progress.
pub const REFRESH_INTERVAL_SECS: u64 = 10;

/// Minimal HTML escaping for text and attribute values.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_outcome(out: &mut String, outcome: &TestOutcome, link: LinkFn<'_>) {
    let url = escape_html(outcome.url());
    match outcome {
        TestOutcome::Failure { error, .. } => {
            let _ = write!(out, "<h6>{url}</h6><p class=\"error\">Error: {}</p>", escape_html(error));
        }
        TestOutcome::Success {
            status_code,
            content_type,
            duration_secs,
            content,
            screenshot,
            ..
        } => {
            let _ = write!(
                out,
                "<h6>{url}</h6>\n<ul>\n<li>Status code: {status_code}</li>\n\
                 <li>Content type: {}</li>\n<li>Load time: {duration_secs:.3}secs</li>\n\
                 <li>Html: <a href=\"{}\" target=\"_blank\">View</a></li>\n</ul>\n",
                escape_html(content_type),
                escape_html(&link(content)),
            );
            match screenshot {
                None => out.push_str("<p>Screenshot is not available for plain HTTP request</p>"),
                Some(Screenshot::Failed { error }) => {
                    let _ = write!(out, "<p>Screenshot error: {}</p>", escape_html(error));
                }
                Some(Screenshot::Captured { blob }) => {
                    let href = escape_html(&link(blob));
                    let _ = write!(
                        out,
                        "<a href=\"{href}\" target=\"_blank\"><img src=\"{href}\" width=\"300\" /></a>"
                    );
                }
            }
        }
    }
}

fn render_group(out: &mut String, group: &ProxyGroup, link: LinkFn<'_>) {
    let _ = write!(
        out,
        "<table>\n<tr><td colspan=\"{}\"><h5>{}</h5></td></tr>\n<tr>",
        group.outcomes.len().max(1),
        escape_html(&group.label)
    );
    for outcome in &group.outcomes {
        out.push_str("<td>");
        render_outcome(out, outcome, link);
        out.push_str("</td>");
    }
    out.push_str("</tr>\n</table>\n<hr />\n");
}

/// Render the full results page. While the run is in progress the page
/// carries a progress bar and reloads itself every [`REFRESH_INTERVAL_SECS`].
pub fn render_page(snapshot: &Snapshot, link: LinkFn<'_>) -> String {
    let mut body = String::new();
    body.push_str("<h1>Test results</h1>\n");
    if snapshot.is_running {
        let _ = write!(
            body,
            "<p>Running: {} of {} done</p>\n<div class=\"progress\"><div class=\"progress-bar\" \
             role=\"progressbar\" style=\"width: {}%\"></div></div>\n",
            snapshot.completed,
            snapshot.total,
            percent(snapshot.completed, snapshot.total)
        );
    } else {
        let _ = write!(body, "<p>Finished: {} results</p>\n", snapshot.outcome_count());
    }
    for group in &snapshot.groups {
        render_group(&mut body, group, link);
    }

    let refresh = if snapshot.is_running {
        format!("<meta http-equiv=\"refresh\" content=\"{REFRESH_INTERVAL_SECS}\" />")
    } else {
        String::new()
    };
    format!(
        "<html>\n<head>\n<meta charset=\"utf-8\" />\n<title>Proxy test results</title>\n\
         <style>\n\
         body {{ padding: 20px; font-family: sans-serif; }}\n\
         table td {{ vertical-align: top; padding: 10px; min-width: 320px; max-width: 320px; font-size: 80%; }}\n\
         h6 {{ word-break: break-all; }}\n\
         .error {{ color: #b00020; }}\n\
         .progress {{ background: #eee; height: 8px; }}\n\
         .progress-bar {{ background: #d9534f; height: 8px; }}\n\
         </style>\n{refresh}\n</head>\n<body>\n{body}</body>\n</html>\n"
    )
}

/// Write the final page to `output`. Artifacts are linked by file path
/// relative to the page, so the page keeps working once the live server is
/// gone.
pub async fn write_page(snapshot: &Snapshot, store: &DirBlobStore, output: &Path) -> Result<()> {
    let page_dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let links = store.file_links(page_dir).await?;
    let html = render_page(snapshot, &|blob: &BlobRef| {
        links.get(blob.key()).cloned().unwrap_or_default()
    });
    tokio::fs::write(output, html)
        .await
        .with_context(|| format!("failed to write results page: {}", output.display()))
}

fn percent(done: usize, total: usize) -> usize {
    if total == 0 {
        100
    } else {
        (done * 100 / total).min(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::{BlobStore, MemoryBlobStore, HTML_CONTENT_TYPE, PNG_CONTENT_TYPE};

    fn live_page(snapshot: &Snapshot, store: &MemoryBlobStore) -> String {
        render_page(snapshot, &|blob: &BlobRef| store.link(blob))
    }

    fn snapshot(is_running: bool, outcomes: Vec<TestOutcome>) -> Snapshot {
        Snapshot {
            total: outcomes.len(),
            completed: outcomes.len(),
            groups: crate::aggregator::group_by_proxy(&outcomes),
            is_running,
        }
    }

    fn failure(url: &str, error: &str) -> TestOutcome {
        TestOutcome::Failure {
            url: url.into(),
            proxy_label: "No proxy".into(),
            error: error.into(),
            finished_at: String::new(),
        }
    }

    #[test]
    fn running_page_refreshes_and_finished_page_does_not() {
        let store = MemoryBlobStore::new("http://h");
        let running = live_page(&snapshot(true, vec![]), &store);
        assert!(running.contains("http-equiv=\"refresh\""));
        assert!(running.contains("progress-bar"));
        let done = live_page(&snapshot(false, vec![]), &store);
        assert!(!done.contains("http-equiv=\"refresh\""));
        assert!(done.contains("Test results"));
    }

    #[test]
    fn failure_message_is_inline_and_escaped() {
        let store = MemoryBlobStore::new("http://h");
        let page = live_page(
            &snapshot(false, vec![failure("http://a.test/?x=<1>", "timeout after 5s")]),
            &store,
        );
        assert!(page.contains("Error: timeout after 5s"));
        assert!(page.contains("http://a.test/?x=&lt;1&gt;"));
        assert!(page.contains("<h5>No proxy</h5>"));
    }

    #[test]
    fn success_links_artifacts_and_describes_screenshot() {
        let store = MemoryBlobStore::new("http://h");
        let plain = TestOutcome::Success {
            url: "http://a.test/".into(),
            proxy_label: "No proxy".into(),
            status_code: 200,
            content_type: "text/html".into(),
            duration_secs: 0.25,
            content: BlobRef("body-key".into()),
            screenshot: None,
            finished_at: String::new(),
        };
        let mut shot = plain.clone();
        if let TestOutcome::Success { screenshot, .. } = &mut shot {
            *screenshot = Some(Screenshot::Captured {
                blob: BlobRef("shot-key".into()),
            });
        }
        let page = live_page(&snapshot(false, vec![plain, shot]), &store);
        assert!(page.contains("Status code: 200"));
        assert!(page.contains("href=\"http://h/blobs/body-key\""));
        assert!(page.contains("not available for plain HTTP request"));
        assert!(page.contains("src=\"http://h/blobs/shot-key\""));
    }

    #[tokio::test]
    async fn written_page_links_files_next_to_it() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("OUTPUT.html");
        let store = DirBlobStore::create(tmp.path().join("OUTPUT_files"), "http://127.0.0.1:8080")
            .await
            .unwrap();
        let content = store.put(b"<p>body</p>".to_vec(), HTML_CONTENT_TYPE).await.unwrap();
        let shot = store.put(vec![0x89, b'P'], PNG_CONTENT_TYPE).await.unwrap();
        let outcome = TestOutcome::Success {
            url: "http://a.test/".into(),
            proxy_label: "No proxy".into(),
            status_code: 200,
            content_type: "text/html".into(),
            duration_secs: 0.1,
            content: content.clone(),
            screenshot: Some(Screenshot::Captured { blob: shot.clone() }),
            finished_at: String::new(),
        };

        write_page(&snapshot(false, vec![outcome]), &store, &output).await.unwrap();

        let page = std::fs::read_to_string(&output).unwrap();
        assert!(!page.contains("127.0.0.1:8080"));
        let body_href = format!("OUTPUT_files/{}.html", content.key());
        let shot_href = format!("OUTPUT_files/{}.png", shot.key());
        assert!(page.contains(&format!("href=\"{body_href}\"")));
        assert!(page.contains(&format!("src=\"{shot_href}\"")));
        assert!(tmp.path().join(&body_href).is_file());
        assert!(tmp.path().join(&shot_href).is_file());
    }
}
