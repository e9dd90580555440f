// Rendering of command reports
//
// Every command builds one serializable report. Json and yaml print the
// report as-is; text goes through the report's own `Sheet` layout.

use std::collections::BTreeMap;
use std::fmt::Display;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

/// A command result that also knows its text layout
pub trait Report: Serialize {
    fn text(&self, sheet: &mut Sheet);
}

impl OutputFormat {
    pub fn render<R: Report>(self, report: &R) -> Result<String> {
        Ok(match self {
            OutputFormat::Text => {
                let mut sheet = Sheet::default();
                report.text(&mut sheet);
                sheet.finish()
            }
            OutputFormat::Json => serde_json::to_string_pretty(report)? + "\n",
            OutputFormat::Yaml => serde_yaml::to_string(report)?,
        })
    }

    pub fn print<R: Report>(self, report: &R) -> Result<()> {
        print!("{}", self.render(report)?);
        Ok(())
    }
}

enum Line {
    Field(String, String),
    Heading(String),
    Count(String, u64),
}

/// Text layout: aligned `label: value` fields followed by count breakdowns
#[derive(Default)]
pub struct Sheet {
    lines: Vec<Line>,
}

impl Sheet {
    pub fn field(&mut self, label: &str, value: impl Display) -> &mut Self {
        self.lines
            .push(Line::Field(format!("{label}:"), value.to_string()));
        self
    }

    /// A titled block of per-kind counts; skipped when empty
    pub fn counts(&mut self, title: &str, counts: &BTreeMap<String, u64>) -> &mut Self {
        if !counts.is_empty() {
            self.lines.push(Line::Heading(title.to_string()));
            for (kind, count) in counts {
                self.lines.push(Line::Count(kind.clone(), *count));
            }
        }
        self
    }

    fn finish(&self) -> String {
        let label_width = self
            .lines
            .iter()
            .filter_map(|line| match line {
                Line::Field(label, _) => Some(label.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let kind_width = self
            .lines
            .iter()
            .filter_map(|line| match line {
                Line::Count(kind, _) => Some(kind.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Field(label, value) => {
                    out.push_str(&format!("{label:<label_width$} {value}\n"))
                }
                Line::Heading(title) => out.push_str(&format!("\n{title}\n")),
                Line::Count(kind, count) => {
                    out.push_str(&format!("  {kind:<kind_width$} {count:>8}\n"))
                }
            }
        }
        out
    }
}
