//! Marked block in a hosts-style file: every `domain` line between the
//! markers is rewritten to `domain <best ip>`.

use super::Patch;

pub const START_MARKER: &str = "##自动CF优选开始##";
pub const END_MARKER: &str = "##自动CF优选结束##";

const TEMPLATE_HINTS: &[&str] = &[
    "# 请在此标记之间添加需要自动更新的域名",
    "# 示例：example.com",
];

pub fn patch_hosts_block(content: &str, ip: &str) -> Patch {
    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let trailing_newline = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();

    let has_start = lines.iter().any(|l| l.trim() == START_MARKER);
    let has_end = lines.iter().any(|l| l.trim() == END_MARKER);

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 5);
    if !has_start || !has_end {
        out.push(START_MARKER.to_string());
        out.extend(TEMPLATE_HINTS.iter().map(|s| s.to_string()));
        out.push(END_MARKER.to_string());
        out.push(String::new());
        out.extend(lines.iter().map(|l| l.to_string()));
        let mut patched = out.join(eol);
        if trailing_newline {
            patched.push_str(eol);
        }
        return Patch { content: patched, changed: true };
    }

    let mut in_block = false;
    for line in lines {
        let trimmed = line.trim();
        if trimmed == START_MARKER {
            in_block = true;
            out.push(line.to_string());
            continue;
        }
        if trimmed == END_MARKER {
            in_block = false;
            out.push(line.to_string());
            continue;
        }
        match line.split_whitespace().next() {
            Some(domain) if in_block && !trimmed.starts_with('#') => out.push(format!("{domain} {ip}")),
            _ => out.push(line.to_string()),
        }
    }

    let mut patched = out.join(eol);
    if trailing_newline {
        patched.push_str(eol);
    }
    let changed = patched != content;
    Patch { content: patched, changed }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(body: &str) -> String {
        format!("127.0.0.1 localhost\n{START_MARKER}\n{body}{END_MARKER}\n::1 localhost\n")
    }

    #[test]
    fn test_rewrites_lines_inside_block_only() {
        let input = block("# mirrors\ncdn.example.com 1.2.3.4\napi.example.com\n\n");
        let patch = patch_hosts_block(&input, "104.16.1.1");
        assert!(patch.changed);
        assert_eq!(
            patch.content,
            block("# mirrors\ncdn.example.com 104.16.1.1\napi.example.com 104.16.1.1\n\n")
        );
    }

    #[test]
    fn test_second_application_is_noop() {
        let input = block("cdn.example.com 1.2.3.4\n");
        let first = patch_hosts_block(&input, "104.16.1.1");
        let second = patch_hosts_block(&first.content, "104.16.1.1");
        assert!(!second.changed);
        assert_eq!(second.content, first.content);
    }

    #[test]
    fn test_extra_tokens_dropped() {
        let input = block("cdn.example.com 1.2.3.4 # old\n");
        let patch = patch_hosts_block(&input, "9.9.9.9");
        assert!(patch.content.contains("\ncdn.example.com 9.9.9.9\n"));
    }

    #[test]
    fn test_missing_markers_get_template_once() {
        let input = "127.0.0.1 localhost\n";
        let patch = patch_hosts_block(input, "1.1.1.1");
        assert!(patch.changed);
        assert!(patch.content.starts_with(START_MARKER));
        assert!(patch.content.ends_with("\n\n127.0.0.1 localhost\n"));

        let again = patch_hosts_block(&patch.content, "1.1.1.1");
        assert!(!again.changed);
        assert_eq!(again.content.matches(START_MARKER).count(), 1);
        assert_eq!(again.content.matches(END_MARKER).count(), 1);
    }

    #[test]
    fn test_only_start_marker_counts_as_missing() {
        let input = format!("{START_MARKER}\nfoo.com 1.1.1.1\n");
        let patch = patch_hosts_block(&input, "2.2.2.2");
        assert!(patch.changed);
        // template prepended, existing lines untouched
        assert!(patch.content.contains("foo.com 1.1.1.1"));
        assert_eq!(patch.content.matches(END_MARKER).count(), 1);
    }

    #[test]
    fn test_empty_file() {
        let patch = patch_hosts_block("", "1.1.1.1");
        assert!(patch.changed);
        assert_eq!(patch.content.lines().count(), 4);
        assert!(!patch_hosts_block(&patch.content, "1.1.1.1").changed);
    }

    #[test]
    fn test_crlf_and_no_trailing_newline_preserved() {
        let input = format!("{START_MARKER}\r\na.com 1.1.1.1\r\n{END_MARKER}");
        let patch = patch_hosts_block(&input, "1.1.1.1");
        assert!(!patch.changed);
        assert_eq!(patch.content, input);

        let patch = patch_hosts_block(&input, "2.2.2.2");
        assert_eq!(patch.content, format!("{START_MARKER}\r\na.com 2.2.2.2\r\n{END_MARKER}"));
    }

    #[test]
    fn test_indented_markers_recognised() {
        let input = format!("  {START_MARKER}  \na.com\n\t{END_MARKER}\n");
        let patch = patch_hosts_block(&input, "1.0.0.1");
        assert_eq!(patch.content, format!("  {START_MARKER}  \na.com 1.0.0.1\n\t{END_MARKER}\n"));
    }

    #[test]
    fn test_ipv6_answer() {
        let patch = patch_hosts_block(&block("a.com\n"), "2606:4700::1");
        assert!(patch.content.contains("a.com 2606:4700::1"));
    }
}
