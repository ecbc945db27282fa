//! Terminal output for the CLI: compiled documents, AST dumps and search hits

use crate::compiler::CompiledQuery;
use serde_json::Value;
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

fn stdout(color: bool) -> StandardStream {
    let choice = if color {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    };
    StandardStream::stdout(choice)
}

/// Print the query, aggregation and suggestion documents of a compilation
pub fn print_compiled(compiled: &CompiledQuery, color: bool) -> io::Result<()> {
    write_compiled(&mut stdout(color), compiled)
}

/// Print an AST dump with node kinds and fields highlighted
pub fn print_dump(dump: &str, color: bool) -> io::Result<()> {
    write_dump(&mut stdout(color), dump)
}

/// Print the primary keys of matching documents
pub fn print_keys(index: &str, keys: &[String], color: bool) -> io::Result<()> {
    write_keys(&mut stdout(color), index, keys)
}

pub fn write_compiled(out: &mut impl WriteColor, compiled: &CompiledQuery) -> io::Result<()> {
    write_section(out, "query", &compiled.query)?;
    if let Some(aggregation) = &compiled.aggregation {
        write_section(out, "aggregation", aggregation)?;
    }
    if let Some(suggest) = &compiled.suggest {
        write_section(out, "suggest", suggest)?;
    }

    out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
    write!(out, "search index")?;
    out.reset()?;
    writeln!(out, ": {}", compiled.search_index)?;

    let used: Vec<&str> = compiled.used_indexes.iter().map(String::as_str).collect();
    out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
    write!(out, "used indexes")?;
    out.reset()?;
    writeln!(out, ": {}", used.join(", "))?;

    if let Some(limit) = &compiled.limit {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
        write!(out, "limit")?;
        out.reset()?;
        let order = if limit.ascending { "asc" } else { "desc" };
        match &limit.sort_field {
            Some(field) => writeln!(out, ": {} {} offset={} size={}", field, order, limit.offset, limit.size)?,
            None => writeln!(out, ": offset={} size={}", limit.offset, limit.size)?,
        }
    }
    Ok(())
}

fn write_section(out: &mut impl WriteColor, title: &str, document: &Value) -> io::Result<()> {
    out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)).set_bold(true))?;
    writeln!(out, "{}", title)?;
    out.reset()?;
    let pretty = serde_json::to_string_pretty(document).map_err(io::Error::other)?;
    writeln!(out, "{}", pretty)?;
    Ok(())
}

pub fn write_dump(out: &mut impl WriteColor, dump: &str) -> io::Result<()> {
    for line in dump.lines() {
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];
        write!(out, "{}", indent)?;

        let (label, rest) = match trimmed.strip_prefix("#filter ") {
            Some(rest) => ("#filter ", rest),
            None => ("", trimmed),
        };
        if !label.is_empty() {
            out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
            write!(out, "{}", label)?;
            out.reset()?;
        }

        let (kind, detail) = rest.split_once(' ').unwrap_or((rest, ""));
        let kind_color = match kind {
            "Expansion" => Color::Yellow,
            "And" | "Or" | "Not" | "With" | "NestedGroup" | "Proximity" => Color::Cyan,
            _ if kind.starts_with('#') => Color::Magenta,
            _ => Color::Blue,
        };
        out.set_color(ColorSpec::new().set_fg(Some(kind_color)).set_bold(true))?;
        write!(out, "{}", kind)?;
        out.reset()?;

        if detail.is_empty() {
            writeln!(out)?;
            continue;
        }
        let (detail, owner) = match detail.rfind(" index=") {
            Some(at) => (&detail[..at], Some(&detail[at + 1..])),
            None => (detail, None),
        };
        write!(out, " ")?;
        out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
        write!(out, "{}", detail)?;
        out.reset()?;
        if let Some(owner) = owner {
            out.set_color(ColorSpec::new().set_dimmed(true))?;
            write!(out, " {}", owner)?;
            out.reset()?;
        }
        writeln!(out)?;
    }
    Ok(())
}

pub fn write_keys(out: &mut impl WriteColor, index: &str, keys: &[String]) -> io::Result<()> {
    out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)).set_bold(true))?;
    write!(out, "{}", index)?;
    out.reset()?;
    writeln!(out, ": {} matching", keys.len())?;
    for key in keys {
        writeln!(out, "{}", key)?;
    }
    Ok(())
}
