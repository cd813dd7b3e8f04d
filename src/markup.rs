use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

static LINE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("line break pattern"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<.*?>").expect("tag pattern"));

/// Turns board comment markup into stored plain text.
///
/// Line breaks become `\n` and every remaining tag is dropped. Entities are
/// left encoded; they are decoded when the text is classified. Running this
/// on its own output returns the input unchanged.
pub fn normalize_comment(raw: &str) -> String {
    let with_newlines = LINE_BREAK.replace_all(raw, "\n");
    TAG.replace_all(&with_newlines, "").into_owned()
}

pub fn decode_entities(text: &str) -> Cow<'_, str> {
    html_escape::decode_html_entities(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_keeps_entities() {
        let raw = r##"<a href="#p123" class="quotelink">&gt;&gt;123</a><br>nice<br/><span class="quote">&gt;implying</span>"##;
        assert_eq!(normalize_comment(raw), "&gt;&gt;123\nnice\n&gt;implying");
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "plain text",
            "a<br>b<BR />c",
            "<<x>br>tail",
            "open < without close\n<b>bold</b>",
            "<wbr>https://youtu.be/<wbr>abc",
            "<br<br>>",
            "<a\nhref=x>multi-line tag</a>",
        ];
        for raw in samples {
            let once = normalize_comment(raw);
            assert_eq!(normalize_comment(&once), once, "input: {raw}");
        }
    }

    #[test]
    fn tags_spanning_lines_are_stripped() {
        assert_eq!(normalize_comment("<br<br>>"), "");
        assert_eq!(normalize_comment("<span\nclass=\"quote\">x</span>"), "x");
    }

    #[test]
    fn decodes_common_entities() {
        assert_eq!(decode_entities("&gt;&gt;1 &amp; &#039;x&#039;"), ">>1 & 'x'");
    }
}
