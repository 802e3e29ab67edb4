//! Heading tree for plain-text extracts rendered with `exsectionformat=wiki`.
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

use super::Section;

const HEADING_PATTERN: &str = r"(?m)^(={2,7})[ \t]*(.+?)[ \t]*={2,7}[ \t]*$";

fn heading_re() -> Result<&'static Regex, regex::Error> {
    static HEADING: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = HEADING.get() {
        return Ok(re);
    }
    let re = Regex::new(HEADING_PATTERN)?;
    Ok(HEADING.get_or_init(|| re))
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedExtract {
    pub summary: String,
    pub sections: Vec<Section>,
}

/// Split an extract into lead text and a section tree. A heading nests under
/// the nearest preceding heading with a smaller level.
pub fn parse_extract(extract: &str) -> Result<ParsedExtract, regex::Error> {
    let re = heading_re()?;
    let headings: Vec<(usize, usize, usize, String)> = re
        .captures_iter(extract)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let level = caps.get(1)?.as_str().len() - 1;
            let title = caps.get(2)?.as_str().trim().to_string();
            Some((whole.start(), whole.end(), level, title))
        })
        .collect();

    let lead_end = headings.first().map_or(extract.len(), |h| h.0);
    let summary = extract[..lead_end].trim().to_string();

    let mut roots: Vec<Section> = Vec::new();
    let mut open: Vec<Section> = Vec::new();
    for (i, (_, end, level, title)) in headings.iter().enumerate() {
        let body_end = headings.get(i + 1).map_or(extract.len(), |next| next.0);
        close_until(&mut open, &mut roots, *level);
        open.push(Section {
            title: title.clone(),
            level: *level,
            text: extract[*end..body_end].trim().to_string(),
            subsections: Vec::new(),
        });
    }
    close_until(&mut open, &mut roots, 0);

    Ok(ParsedExtract {
        summary,
        sections: roots,
    })
}

/// Pop every open section whose level is `>= level` into its parent.
fn close_until(open: &mut Vec<Section>, roots: &mut Vec<Section>, level: usize) {
    while open.last().is_some_and(|s| s.level >= level) {
        let Some(done) = open.pop() else { break };
        match open.last_mut() {
            Some(parent) => parent.subsections.push(done),
            None => roots.push(done),
        }
    }
}

/// Text of `section` followed by every descendant in document order, non-empty
/// pieces joined with `\n`. Descendants more than `max_depth` levels below
/// `section` are dropped.
pub fn flatten_section(section: &Section, max_depth: usize) -> String {
    let mut pieces: Vec<&str> = Vec::new();
    let mut stack: Vec<(&Section, usize)> = vec![(section, 0)];
    while let Some((node, depth)) = stack.pop() {
        if !node.text.is_empty() {
            pieces.push(&node.text);
        }
        if depth >= max_depth {
            if !node.subsections.is_empty() {
                debug!(section = %node.title, depth, "section tree deeper than limit; truncating");
            }
            continue;
        }
        stack.extend(node.subsections.iter().rev().map(|s| (s, depth + 1)));
    }
    pieces.join("\n")
}
