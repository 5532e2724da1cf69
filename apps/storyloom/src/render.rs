use std::collections::HashMap;
use std::io::{self, Write};

use storyloom_client::SessionView;
use storyloom_proto::{Message, MessageStatus, Role, Scene};

#[derive(Debug, Default)]
struct Shown {
    text: String,
    status: Option<MessageStatus>,
}

/// Incremental terminal renderer: chat text is written as it grows, tool and
/// job messages get one line per status change.
#[derive(Debug, Default)]
pub struct Printer {
    shown: HashMap<String, Shown>,
    mid_line: bool,
}

impl Printer {
    pub fn update(&mut self, view: &SessionView) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write_view(&mut out, view)?;
        out.flush()
    }

    pub fn end_line(&mut self) -> io::Result<()> {
        if self.mid_line {
            self.mid_line = false;
            println!();
        }
        Ok(())
    }

    fn write_view(&mut self, out: &mut impl Write, view: &SessionView) -> io::Result<()> {
        for message in &view.messages {
            match message.role {
                Role::Tool => self.write_tool(out, message)?,
                Role::User | Role::Assistant => self.write_chat(out, message)?,
            }
        }
        Ok(())
    }

    fn write_chat(&mut self, out: &mut impl Write, message: &Message) -> io::Result<()> {
        let is_new = !self.shown.contains_key(&message.id);
        let shown = self.shown.entry(message.id.clone()).or_default();
        if shown.text == message.content {
            return Ok(());
        }
        if is_new || !message.content.starts_with(&shown.text) {
            if self.mid_line {
                writeln!(out)?;
            }
            write!(out, "{}> {}", role_label(message.role), message.content)?;
        } else {
            write!(out, "{}", &message.content[shown.text.len()..])?;
        }
        shown.text.clone_from(&message.content);
        self.mid_line = true;
        Ok(())
    }

    fn write_tool(&mut self, out: &mut impl Write, message: &Message) -> io::Result<()> {
        let shown = self.shown.entry(message.id.clone()).or_default();
        if shown.status == Some(message.status) {
            return Ok(());
        }
        shown.status = Some(message.status);
        if self.mid_line {
            writeln!(out)?;
            self.mid_line = false;
        }
        writeln!(out, "{}", describe_tool(message))
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "agent",
        Role::Tool => "tool",
    }
}

pub fn describe_tool(message: &Message) -> String {
    let name = message.tool_name.as_deref().unwrap_or("tool");
    let status = match message.status {
        MessageStatus::Running => "running",
        MessageStatus::Complete => "done",
        MessageStatus::Error => "failed",
        MessageStatus::Streaming => "streaming",
    };
    let mut line = format!("  [{name}] {status}");
    if let Some(progress) = message.output.get("progress").and_then(|p| p.as_f64()) {
        line.push_str(&format!(" {progress:.0}%"));
    }
    if let Some(error) = &message.error {
        line.push_str(&format!(": {error}"));
    }
    line
}

pub fn scene_lines(scenes: &[Scene]) -> Vec<String> {
    scenes
        .iter()
        .map(|scene| {
            let mut line = format!("scene {}", scene.id);
            if let Some(title) = scene.title() {
                line.push_str(&format!(": {title}"));
            }
            if let Some(duration) = scene.duration() {
                line.push_str(&format!(" ({duration}s)"));
            }
            line
        })
        .collect()
}
