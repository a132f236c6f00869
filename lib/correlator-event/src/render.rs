//! A minimal `${field}` substitution formatter. Deliberately not a general
//! template engine: the only required behaviours are flat-map interpolation
//! and, for named template families, a separate section per content type
//! (handled by [`TemplateSet`](crate::TemplateSet) rather than by this
//! module).

use indexmap::IndexMap;

/// Replaces every `${name}` occurrence in `template` with the matching entry
/// from `context`. An unknown name is left verbatim (`${unknown}`) so
/// template authoring mistakes are visible in the rendered output rather
/// than silently swallowed.
pub fn substitute(template: &str, context: &IndexMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(close) = template[i + 2..].find('}') {
                let name = &template[i + 2..i + 2 + close];
                match context.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                i += 2 + close + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().expect("i < len");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_fields() {
        let mut ctx = IndexMap::new();
        ctx.insert("user".to_string(), "alice".to_string());
        ctx.insert("count".to_string(), "3".to_string());
        assert_eq!(
            substitute("user ${user} saw ${count} events", &ctx),
            "user alice saw 3 events"
        );
    }

    #[test]
    fn unknown_field_is_left_verbatim() {
        let ctx = IndexMap::new();
        assert_eq!(substitute("hello ${missing}", &ctx), "hello ${missing}");
    }

    #[test]
    fn unterminated_placeholder_passes_through() {
        let ctx = IndexMap::new();
        assert_eq!(substitute("broken ${oops", &ctx), "broken ${oops");
    }
}
