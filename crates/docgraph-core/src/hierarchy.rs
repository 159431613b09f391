//! Chapter/section tree reconstruction from parsed page text.
//!
//! A pure function over the parser's output: markdown-style (`## Title`),
//! numbered (`2.1 Title`), and short all-caps lines are treated as heading
//! markers. When no markers exist the builder returns a single flat root
//! covering the whole document. Failure to find structure is never fatal;
//! it only degrades downstream organization.

use crate::chunk::PageText;
use crate::models::SectionNode;

/// Maximum heading line length; longer lines are treated as body text.
const MAX_HEADING_CHARS: usize = 80;
/// Nesting depth cap; deeper markers clamp to this level.
const MAX_LEVEL: u8 = 4;

/// Build a section tree from parsed pages.
///
/// Returns a root node spanning all pages; detected headings become nested
/// children by level. With no detectable structure the root has no
/// children.
pub fn build(pages: &[PageText]) -> SectionNode {
    let page_count = pages
        .iter()
        .map(|p| p.page_number)
        .max()
        .unwrap_or(1)
        .max(1);
    let mut root = SectionNode::flat_root(page_count);

    let mut headings: Vec<(u8, String, i64)> = Vec::new();
    for page in pages {
        let mut lines = page.text.lines().peekable();
        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.chars().count() > MAX_HEADING_CHARS {
                continue;
            }
            // Underline-style: a title line followed by === or ---.
            if let Some(next) = lines.peek() {
                let underline = next.trim();
                if underline.len() >= 3
                    && (underline.chars().all(|c| c == '=')
                        || underline.chars().all(|c| c == '-'))
                {
                    let level = if underline.starts_with('=') { 1 } else { 2 };
                    headings.push((level, trimmed.to_string(), page.page_number));
                    lines.next();
                    continue;
                }
            }
            if let Some((level, title)) = detect_heading(trimmed) {
                headings.push((level, title, page.page_number));
            }
        }
    }

    if headings.is_empty() {
        return root;
    }

    // Fold the flat heading list into a tree with a level stack. Page
    // ranges: a section ends where the next same-or-higher heading starts.
    let ends: Vec<i64> = headings
        .iter()
        .enumerate()
        .map(|(i, &(level, _, _))| {
            headings[i + 1..]
                .iter()
                .find(|&&(l, _, _)| l <= level)
                .map(|&(_, _, p)| p)
                .unwrap_or(page_count)
        })
        .collect();

    let nodes: Vec<SectionNode> = headings
        .iter()
        .zip(&ends)
        .map(|(&(level, ref title, page), &end)| SectionNode {
            title: title.clone(),
            level,
            page_start: page.max(1),
            page_end: end.max(page).max(1),
            children: Vec::new(),
        })
        .collect();

    // The parent of heading i is the closest previous heading with a
    // smaller level; headings with no such parent hang off the root.
    let mut children_of: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut top_level: Vec<usize> = Vec::new();
    for i in 0..headings.len() {
        let level = headings[i].0;
        match (0..i).rev().find(|&j| headings[j].0 < level) {
            Some(j) => children_of[j].push(i),
            None => top_level.push(i),
        }
    }

    fn assemble(i: usize, children_of: &[Vec<usize>], nodes: &[SectionNode]) -> SectionNode {
        let mut node = nodes[i].clone();
        for &child in &children_of[i] {
            node.children.push(assemble(child, children_of, nodes));
        }
        node
    }

    for &i in &top_level {
        root.children.push(assemble(i, &children_of, &nodes));
    }
    root
}

/// Detect a heading marker in a single line.
///
/// Recognized forms, in order: markdown `#`-prefixes, dotted numbering
/// (`3.`, `3.2`, `3.2.1` followed by a title), and short all-caps lines.
fn detect_heading(line: &str) -> Option<(u8, String)> {
    // Markdown: level = number of leading '#'.
    if line.starts_with('#') {
        let hashes = line.chars().take_while(|&c| c == '#').count();
        let title = line[hashes..].trim();
        if (1..=MAX_LEVEL as usize).contains(&hashes) && !title.is_empty() {
            return Some((hashes as u8, title.to_string()));
        }
        return None;
    }

    // Numbered: "2 Title", "2.1 Title", "2.1.3 Title".
    if let Some((prefix, rest)) = line.split_once(' ') {
        let prefix = prefix.trim_end_matches('.');
        let segments: Vec<&str> = prefix.split('.').collect();
        let numeric = !segments.is_empty()
            && segments.iter().all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()));
        let title = rest.trim();
        if numeric && !title.is_empty() && title.chars().next().is_some_and(|c| c.is_uppercase()) {
            let level = (segments.len() as u8).min(MAX_LEVEL);
            return Some((level, title.to_string()));
        }
    }

    // Short all-caps line with at least two letters, e.g. "INTRODUCTION".
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() >= 2
        && letters.iter().all(|c| c.is_uppercase())
        && line.split_whitespace().count() <= 6
    {
        return Some((1, line.to_string()));
    }

    None
}
