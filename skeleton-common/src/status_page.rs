use std::fmt::{self, Write};

use health::{KeyedResult, ProbeStatus};

const HEAD: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Status page</title>
    <link rel="stylesheet" href="https://cdnjs.cloudflare.com/ajax/libs/bulma/0.6.2/css/bulma.min.css" />
    <script defer src="https://use.fontawesome.com/releases/v5.0.6/js/all.js"></script>
  </head>
  <body>
    <section class="section">
      <div class="container">
"#;

const TAIL: &str = r#"      </div>
    </section>
  </body>
</html>
"#;

/// Renders the HTML status page: the replicas of each service first, then
/// the uptime of the datastores.
pub fn render(uptime: &[KeyedResult], services: &[KeyedResult]) -> Result<String, fmt::Error> {
    let mut page = String::with_capacity(4096);
    page.push_str(HEAD);
    write_table(&mut page, "Service info", services, true)?;
    write_table(&mut page, "Uptime", uptime, false)?;
    page.push_str(TAIL);
    Ok(page)
}

fn write_table(
    out: &mut String,
    title: &str,
    rows: &[KeyedResult],
    with_replicas: bool,
) -> fmt::Result {
    writeln!(out, r#"        <h2 class="title is-4">{}</h2>"#, escape(title))?;
    writeln!(out, r#"        <table class="table">"#)?;
    writeln!(out, "          <thead>")?;
    writeln!(out, "            <tr>")?;
    writeln!(out, r#"              <th style="width: 150px">Key</th>"#)?;
    writeln!(
        out,
        r#"              <th style="width: 100px; text-align: center">Status</th>"#
    )?;
    if with_replicas {
        writeln!(
            out,
            r#"              <th style="width: 100px; text-align: center">Replicas</th>"#
        )?;
    }
    writeln!(out, r#"              <th style="width: auto">Info</th>"#)?;
    writeln!(out, "            </tr>")?;
    writeln!(out, "          </thead>")?;
    writeln!(out, "          <tbody>")?;

    for row in rows {
        let (class, icon) = status_icon(row.result.status());
        writeln!(out, "            <tr>")?;
        writeln!(out, "              <td>{}</td>", escape(&row.key))?;
        writeln!(
            out,
            r#"              <td style="text-align: center" title="{status}">"#,
            status = row.result.status(),
        )?;
        writeln!(
            out,
            r#"                <span class="icon {class}"><i class="fas {icon}"></i></span>"#
        )?;
        writeln!(out, "              </td>")?;
        if with_replicas {
            writeln!(
                out,
                r#"              <td style="text-align: center">{}</td>"#,
                row.result.instance_count()
            )?;
        }
        writeln!(out, "              <td>{}</td>", info_html(row.result.info()))?;
        writeln!(out, "            </tr>")?;
    }

    writeln!(out, "          </tbody>")?;
    writeln!(out, "        </table>")
}

fn status_icon(status: ProbeStatus) -> (&'static str, &'static str) {
    match status {
        ProbeStatus::Healthy => ("has-text-success", "fa-check-square"),
        ProbeStatus::Warning => ("has-text-warning", "fa-exclamation-triangle"),
        ProbeStatus::Error => ("has-text-danger", "fa-ban"),
        ProbeStatus::Unknown => ("has-text-info", "fa-info-circle"),
    }
}

// Replica summaries are joined with <br>, keep those as line breaks.
fn info_html(info: &str) -> String {
    info.split("<br>")
        .map(escape)
        .collect::<Vec<_>>()
        .join("<br>")
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::ProbeResult;

    fn keyed(key: &str, result: ProbeResult) -> KeyedResult {
        KeyedResult {
            key: key.to_owned(),
            result,
        }
    }

    #[test]
    fn services_come_before_uptime() {
        let page = render(
            &[keyed("SkeletonDb", ProbeResult::healthy("PostgreSQL v16.2"))],
            &[
                keyed("api", ProbeResult::healthy_instances("a<br>b", 2)),
                keyed("scheduler", ProbeResult::error("")),
            ],
        )
        .unwrap();

        let services = page.find("Service info").unwrap();
        let uptime = page.find("Uptime").unwrap();
        assert!(services < uptime);
        assert!(page.find("<td>api</td>").unwrap() < uptime);
        assert!(page.find("<td>SkeletonDb</td>").unwrap() > uptime);
        assert_eq!(page.matches(">Replicas</th>").count(), 1);
        assert!(page.contains("<td>a<br>b</td>"));
        assert!(page.contains("fa-ban"));
        assert!(page.contains("fa-check-square"));
    }

    #[test]
    fn info_is_escaped() {
        let page = render(
            &[keyed("db", ProbeResult::error("<script>alert(1)</script>"))],
            &[],
        )
        .unwrap();

        assert!(!page.contains("<script>alert"));
        assert!(page.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
    }
}
