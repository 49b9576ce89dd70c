use std::sync::OnceLock;

use regex::Regex;

/// Cosmetic cleanup applied to tool results before they are shown in-stream.
/// Every transform is idempotent: `format_tool_text(format_tool_text(x)) ==
/// format_tool_text(x)`.
pub fn format_tool_text(input: &str) -> String {
    let collapsed = collapse_newlines(input);
    let linked = link_bare_urls(&collapsed);
    space_structure(&linked)
}

fn newline_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("static regex"))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>()\[\]"']+"#).expect("static regex"))
}

fn collapse_newlines(input: &str) -> String {
    newline_re().replace_all(input, "\n\n").into_owned()
}

/// Wraps bare URLs as markdown links. URLs immediately preceded by `[` or `(`
/// are already part of a link and are left alone, which is what makes the
/// pass idempotent.
fn link_bare_urls(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for m in url_re().find_iter(input) {
        out.push_str(&input[last..m.start()]);
        let prev = input[..m.start()].chars().next_back();
        let url = m.as_str();
        if matches!(prev, Some('[') | Some('(')) {
            out.push_str(url);
        } else {
            let trimmed = url.trim_end_matches(['.', ',', ';']);
            let tail = &url[trimmed.len()..];
            out.push('[');
            out.push_str(trimmed);
            out.push_str("](");
            out.push_str(trimmed);
            out.push(')');
            out.push_str(tail);
        }
        last = m.end();
    }
    out.push_str(&input[last..]);
    out
}

fn is_bullet(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("- ") || t.starts_with("• ")
}

fn is_header(line: &str) -> bool {
    let t = line.trim();
    (3..=60).contains(&t.len()) && t.ends_with(':') && !is_bullet(line) && !t.contains("http")
}

/// Ensures a blank line before bullet runs and around short header-like
/// lines ending in a colon. Only ever inserts single blank lines next to
/// nonempty ones, so no 3+ newline runs appear.
fn space_structure(input: &str) -> String {
    let lines: Vec<&str> = input.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let prev_nonempty = out.last().is_some_and(|l| !l.trim().is_empty());
        let prev_bullet = out.last().is_some_and(|l| is_bullet(l));
        if is_bullet(line) {
            if prev_nonempty && !prev_bullet {
                out.push(String::new());
            }
        } else if is_header(line) && prev_nonempty {
            out.push(String::new());
        }
        out.push((*line).to_string());
        if is_header(line) {
            if let Some(next) = lines.get(i + 1) {
                if !next.trim().is_empty() {
                    out.push(String::new());
                }
            }
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_idempotent(input: &str) {
        let once = format_tool_text(input);
        let twice = format_tool_text(&once);
        assert_eq!(once, twice, "not idempotent for {input:?}");
    }

    #[test]
    fn collapses_excess_newlines() {
        assert_eq!(format_tool_text("a\n\n\n\nb"), "a\n\nb");
        assert_idempotent("a\n\n\n\nb");
    }

    #[test]
    fn inserts_blank_before_bullet_run() {
        let out = format_tool_text("Findings for IL7:\n- variant one\n- variant two");
        assert_eq!(out, "Findings for IL7:\n\n- variant one\n- variant two");
        assert_idempotent("Findings for IL7:\n- variant one\n- variant two");
    }

    #[test]
    fn wraps_bare_urls_only_once() {
        let out = format_tool_text("see https://example.org/paper for details");
        assert_eq!(out, "see [https://example.org/paper](https://example.org/paper) for details");
        assert_idempotent("see https://example.org/paper for details");
    }

    #[test]
    fn leaves_existing_markdown_links_alone() {
        let input = "see [the paper](https://example.org/paper) for details";
        assert_eq!(format_tool_text(input), input);
    }

    #[test]
    fn trailing_punctuation_stays_outside_link() {
        let out = format_tool_text("read https://example.org.");
        assert_eq!(out, "read [https://example.org](https://example.org).");
        assert_idempotent("read https://example.org.");
    }

    #[test]
    fn spaces_out_short_headers() {
        let out = format_tool_text("intro text\nResults:\nfirst result");
        assert_eq!(out, "intro text\n\nResults:\n\nfirst result");
        assert_idempotent("intro text\nResults:\nfirst result");
    }

    #[test]
    fn bullet_ending_in_colon_is_not_a_header() {
        let input = "- genes found:\n- none";
        assert_eq!(format_tool_text(input), input);
    }

    #[test]
    fn idempotent_on_mixed_noisy_input() {
        let inputs = [
            "",
            "\n\n\n",
            "Summary:\n\n\n- a\n- b\n\n\nmore at https://x.org/a, then done.\nNext steps:\ngo",
            "• unicode bullet\nplain\n• another",
            "header at end:",
            "already\n\n- spaced\n\nSection:\n\nbody [x](https://a.io) tail",
        ];
        for input in inputs {
            assert_idempotent(input);
        }
    }
}
