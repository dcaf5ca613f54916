use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the epoch; the reception-timestamp granularity
/// of the whole pipeline.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Substitute printf-style placeholders (`%s`, `%u`, `%d`) left to right
/// with `args`. Placeholders beyond the argument list are left untouched,
/// mirroring how the legacy command templates were expanded.
pub fn render_template(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut args = args.iter();
    while let Some(pos) = rest.find('%') {
        let (head, tail) = rest.split_at(pos);
        out.push_str(head);
        let mut chars = tail.chars();
        chars.next();
        match chars.next() {
            Some(c @ ('s' | 'u' | 'd')) => match args.next() {
                Some(arg) => {
                    out.push_str(arg);
                    rest = &tail[2..];
                }
                None => {
                    out.push('%');
                    out.push(c);
                    rest = &tail[2..];
                }
            },
            Some(c) => {
                out.push('%');
                out.push(c);
                rest = &tail[1 + c.len_utf8()..];
            }
            None => {
                out.push('%');
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_placeholders_in_order() {
        assert_eq!(
            render_template("lame %s %s > /tmp/%s.log", &["in.wav", "out.mp3", "voice_7"]),
            "lame in.wav out.mp3 > /tmp/voice_7.log"
        );
    }

    #[test]
    fn mixed_placeholder_kinds_and_literals() {
        assert_eq!(
            render_template("/tmp/voice_%u_%u_%s.%s", &["42", "100", "feeder1", "wav"]),
            "/tmp/voice_42_100_feeder1.wav"
        );
        assert_eq!(render_template("100%% done: %s", &["yes"]), "100%% done: yes");
    }

    #[test]
    fn surplus_placeholders_survive() {
        assert_eq!(render_template("a %s b %s", &["x"]), "a x b %s");
    }
}
