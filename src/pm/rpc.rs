use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::pm::app::{AppSpec, AppStatus, CommandSet};
use crate::pm::events::EventEntry;
use crate::pm::network::{Classification, Listener};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    Create { spec: AppSpec },
    Update { id: String, commands: CommandSet },
    Delete { id: String },
    Get { id: String },
    List,
    Restart {
        id: String,
        #[serde(default)]
        hard_reset: bool,
        #[serde(default)]
        command_reset: bool,
    },
    Kill {
        id: String,
        #[serde(default)]
        include_init: bool,
    },
    Network { id: String },
    Events {
        #[serde(default)]
        id: Option<String>,
        #[serde(default = "default_event_lines")]
        n: usize,
    },
    Version,
}

fn default_event_lines() -> usize {
    200
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub apps: Vec<AppStatus>,
    #[serde(default)]
    pub network: Option<Classification>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn render_text(&self) -> String {
        if let Some(net) = &self.network {
            return render_network(net);
        }
        if !self.events.is_empty() {
            return self
                .events
                .iter()
                .map(|e| match &e.app {
                    Some(a) => format!("{} [{}] app={a} {}", e.ts, e.component, e.message),
                    None => format!("{} [{}] {}", e.ts, e.component, e.message),
                })
                .collect::<Vec<_>>()
                .join("\n");
        }
        if !self.message.is_empty() && self.apps.is_empty() {
            return self.message.clone();
        }
        if self.apps.is_empty() {
            return "(no applications)".to_string();
        }

        let headers = ["id", "state", "stage", "pid", "exit", "command", "path"];
        // One row per process; the first row of an app carries its id, state and path.
        let mut groups: Vec<Vec<Vec<String>>> = Vec::new();
        for a in &self.apps {
            if a.processes.is_empty() {
                groups.push(vec![vec![
                    a.id.clone(),
                    a.state.to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    a.path.clone(),
                ]]);
                continue;
            }
            let mut g = Vec::new();
            for (i, p) in a.processes.iter().enumerate() {
                let first = i == 0;
                g.push(vec![
                    if first { a.id.clone() } else { String::new() },
                    if first { a.state.to_string() } else { String::new() },
                    p.stage.to_string(),
                    p.pid.to_string(),
                    p.exit.clone().unwrap_or_else(|| "running".to_string()),
                    p.command.clone(),
                    if first { a.path.clone() } else { String::new() },
                ]);
            }
            groups.push(g);
        }
        render_table(&headers, &groups)
    }
}

fn render_network(net: &Classification) -> String {
    let headers = ["owner", "addr", "pid", "process"];
    let row = |owner: &str, l: &Listener| {
        vec![
            owner.to_string(),
            l.addr.to_string(),
            l.pid.to_string(),
            l.process_name.clone(),
        ]
    };
    let mut group: Vec<Vec<String>> = net.owned.iter().map(|l| row("app", l)).collect();
    group.extend(net.unowned.iter().map(|l| row("none", l)));
    if group.is_empty() {
        return "(no listeners)".to_string();
    }
    render_table(&headers, &[group])
}

fn render_table(headers: &[&str], groups: &[Vec<Vec<String>>]) -> String {
    fn pad(s: &str, width: usize) -> String {
        format!("{s:<width$}")
    }

    fn border(widths: &[usize]) -> String {
        let mut out = String::from("+");
        for w in widths {
            // 1 leading + 1 trailing padding space per cell.
            out.push_str(&"-".repeat(*w + 2));
            out.push('+');
        }
        out
    }

    fn row_line(cols: &[String], widths: &[usize]) -> String {
        let mut out = String::from("|");
        for (i, w) in widths.iter().enumerate() {
            let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
            out.push(' ');
            out.push_str(&pad(v, *w));
            out.push_str(" |");
        }
        out
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for r in groups.iter().flatten() {
        for (i, c) in r.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(c.len());
            }
        }
    }

    let top = border(&widths);
    let mut out = String::new();
    out.push_str(&top);
    out.push('\n');
    out.push_str(&row_line(
        &headers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        &widths,
    ));
    out.push('\n');
    out.push_str(&top);
    out.push('\n');
    for g in groups {
        for r in g {
            out.push_str(&row_line(r, &widths));
            out.push('\n');
        }
        // One separator per group, even when it spans several process rows.
        out.push_str(&top);
        out.push('\n');
    }
    out
}

pub fn client_call(sock: &Path, req: Request) -> anyhow::Result<Response> {
    let mut stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!(
            "failed to connect to pipemaster socket {}: {e}",
            sock.display()
        )
    })?;

    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut resp_line = String::new();
    reader.read_line(&mut resp_line)?;
    if resp_line.trim().is_empty() {
        anyhow::bail!("empty response from daemon");
    }
    let resp: Response = serde_json::from_str(resp_line.trim_end())?;
    if !resp.ok {
        anyhow::bail!("{}", resp.message);
    }
    Ok(resp)
}
