//! Formatted output helpers for CLI commands.
//!
//! Formatting is kept free of I/O so commands only decide where the lines
//! go.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use ephemera_common::types::Port;
use ephemera_env::export::ExportedEnvironment;
use ephemera_template::info::TemplateInfo;
use ephemera_template::spec::{ImageSpec, TemplateInstantiation};

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const CYAN: &str = "\x1b[36m";
pub const RESET: &str = "\x1b[0m";

/// Formats published ports as `internal->external` pairs.
#[must_use]
pub fn format_ports(ports: &BTreeMap<String, Port>) -> String {
    if ports.is_empty() {
        return "-".into();
    }
    ports
        .iter()
        .map(|(internal, external)| format!("{internal}->{external}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One line per created container, grouped by template instance.
#[must_use]
pub fn environment_lines(export: &ExportedEnvironment) -> Vec<String> {
    let mut lines = vec![format!(
        "{} ({} container(s), keepalive {})",
        export.id,
        export.container_count(),
        export.keep_alive
    )];
    for (template, instances) in &export.templates {
        for (index, instance) in instances.iter().enumerate() {
            for (name, container) in &instance.containers {
                lines.push(format!(
                    "  {template}[{index}] {name}  {}  {}  {}",
                    container.hostname,
                    container.id,
                    format_ports(&container.ports)
                ));
            }
        }
    }
    lines
}

/// Describes the images and containers a template instance declares.
#[must_use]
pub fn instantiation_lines(inst: &TemplateInstantiation) -> Vec<String> {
    let mut lines = vec![format!("+ {}[{}]", inst.template, inst.index)];
    for image in &inst.images {
        let kind = match image {
            ImageSpec::Build { .. } => "build",
            ImageSpec::Fetch { .. } => "fetch",
        };
        lines.push(format!("    {kind} {}", image.tag()));
        for container in image.containers() {
            let mut line = format!("      {}", container.hostname());
            if !container.ports.is_empty() {
                let ports: Vec<_> = container.ports.iter().map(ToString::to_string).collect();
                let _ = write!(line, " ports={}", ports.join(","));
            }
            if !container.mounts.is_empty() {
                let _ = write!(line, " mounts={}", container.mounts.len());
            }
            if !container.readiness.is_empty() {
                let _ = write!(line, " checks={}", container.readiness.len());
            }
            lines.push(line);
        }
    }
    lines
}

/// Describes a template and its parameters.
#[must_use]
pub fn template_lines(info: &TemplateInfo) -> Vec<String> {
    let mut lines = vec![if info.description.is_empty() {
        info.name.clone()
    } else {
        format!("{}: {}", info.name, info.description)
    }];
    for (name, param) in &info.parameters {
        let mandatory = if param.mandatory { ", mandatory" } else { "" };
        lines.push(format!(
            "    {name} ({}{mandatory}) {}",
            param.kind, param.description
        ));
    }
    for file in &info.data_files {
        lines.push(format!("    data: {}", file.display()));
    }
    lines
}
