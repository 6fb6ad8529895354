//! Text helpers for invite links and message content

const INVITE_PREFIXES: &[&str] = &["discord.gg/", "discord.com/invite/", "discordapp.com/invite/"];

const TEMPLATE_PREFIXES: &[&str] = &[
    "discord.new/",
    "discord.com/template/",
    "discordapp.com/template/",
];

/// Characters escaped anywhere in the text
const MARKDOWN_CHARS: &[char] = &['\\', '*', '_', '~', '`', '|'];

/// Extract the invite code from an invite URL, or return the input unchanged
pub fn resolve_invite(url: &str) -> String {
    resolve_code(url, INVITE_PREFIXES)
}

/// Extract the template code from a template URL, or return the input unchanged
pub fn resolve_template(url: &str) -> String {
    resolve_code(url, TEMPLATE_PREFIXES)
}

fn resolve_code(url: &str, prefixes: &[&str]) -> String {
    let trimmed = url.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let host_path = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);

    for prefix in prefixes {
        if let Some(rest) = host_path.strip_prefix(prefix) {
            let code: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect();
            if !code.is_empty() {
                return code;
            }
        }
    }

    url.to_string()
}

/// Escape markdown formatting characters with a backslash.
///
/// URLs are left untouched so links keep working.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    let mut rest = text;
    let mut at_line_start = true;

    while let Some(c) = rest.chars().next() {
        if rest.starts_with("http://") || rest.starts_with("https://") {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            out.push_str(&rest[..end]);
            rest = &rest[end..];
            at_line_start = false;
            continue;
        }

        if MARKDOWN_CHARS.contains(&c) || (c == '>' && at_line_start) {
            out.push('\\');
        }
        out.push(c);
        at_line_start = c == '\n';
        rest = &rest[c.len_utf8()..];
    }

    out
}

/// Break `@everyone`, `@here` and user/role mentions with a zero-width space
pub fn escape_mentions(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (index, c) in text.char_indices() {
        out.push(c);
        if c == '@' && is_mention_target(&text[index + 1..]) {
            out.push('\u{200b}');
        }
    }
    out
}

fn is_mention_target(rest: &str) -> bool {
    if rest.starts_with("everyone") || rest.starts_with("here") {
        return true;
    }
    let digits = rest.strip_prefix(|c| c == '!' || c == '&').unwrap_or(rest);
    digits.bytes().take_while(u8::is_ascii_digit).count() >= 17
}
