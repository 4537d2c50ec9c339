/// A run of assistant text with its emphasis state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub bold: bool,
    pub italic: bool,
}

impl Segment {
    fn new(text: String, bold: bool, italic: bool) -> Self {
        Segment { text, bold, italic }
    }
}

/// Splits one line of model output on `**bold**` and `*italic*` markers.
/// Unclosed markers are kept as literal text.
pub fn parse_emphasis(line: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut plain = String::new();
    let mut rest = line;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("**") {
            if let Some(end) = after.find("**") {
                if end > 0 {
                    flush(&mut segments, &mut plain);
                    segments.push(Segment::new(after[..end].to_string(), true, false));
                    rest = &after[end + 2..];
                    continue;
                }
            }
        } else if let Some(after) = rest.strip_prefix('*') {
            if let Some(end) = after.find('*') {
                if end > 0 && !after.starts_with(' ') {
                    flush(&mut segments, &mut plain);
                    segments.push(Segment::new(after[..end].to_string(), false, true));
                    rest = &after[end + 1..];
                    continue;
                }
            }
        }
        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            plain.push(ch);
        }
        rest = chars.as_str();
    }
    flush(&mut segments, &mut plain);
    segments
}

fn flush(segments: &mut Vec<Segment>, plain: &mut String) {
    if !plain.is_empty() {
        segments.push(Segment::new(std::mem::take(plain), false, false));
    }
}
