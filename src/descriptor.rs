//! Rewrites class names embedded in field/method descriptors and generic
//! signatures. The mapper callback returns `Some(new name)` for a renamed
//! class and `None` when the name is unchanged; both functions mirror that
//! contract so callers can skip untouched constant-pool entries.

/// Rewrites a field or method descriptor. Works on any linear descriptor
/// (`I`, `[Lcom/a;`, `(ILcom/a;)Lcom/b;`).
pub fn map_descriptor<F>(descriptor: &str, map: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(descriptor.len());
    let mut changed = false;
    let mut rest = descriptor;
    while let Some(start) = rest.find('L') {
        let (head, tail) = rest.split_at(start + 1);
        out.push_str(head);
        let end = match tail.find(';') {
            Some(end) => end,
            // Malformed; pass the remainder through untouched.
            None => {
                out.push_str(tail);
                rest = "";
                break
            }
        };
        let name = &tail[..end];
        match map(name) {
            Some(mapped) => {
                changed = true;
                out.push_str(&mapped);
            }
            None => out.push_str(name),
        }
        out.push(';');
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    if changed { Some(out) } else { None }
}

/// Rewrites a generic signature (class, member or method signature).
///
/// Inner-class segments (`Louter<...>.Inner;`) are resolved against the
/// enclosing class context so `outer$Inner` lookups see the full binary name.
pub fn map_signature<F>(signature: &str, map: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(signature.len());
    let mut changed = false;
    // Class context per generic nesting depth, for '.'-separated inner names.
    let mut context: Vec<Option<String>> = vec![None];
    let chars: Vec<char> = signature.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            'L' => {
                out.push('L');
                i += 1;
                let start = i;
                while i < chars.len() && !matches!(chars[i], ';' | '<' | '.') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                match map(&name) {
                    Some(mapped) => {
                        changed = true;
                        out.push_str(&mapped);
                    }
                    None => out.push_str(&name),
                }
                *context.last_mut().unwrap() = Some(name);
            }
            '.' => {
                out.push('.');
                i += 1;
                let start = i;
                while i < chars.len() && !matches!(chars[i], ';' | '<' | '.') {
                    i += 1;
                }
                let segment: String = chars[start..i].iter().collect();
                let full = match context.last().cloned().flatten() {
                    Some(outer) => format!("{}${}", outer, segment),
                    None => segment.clone(),
                };
                match map(&full) {
                    Some(mapped) => {
                        changed = true;
                        let simple = mapped.rsplit('$').next().unwrap_or(&mapped);
                        out.push_str(simple);
                    }
                    None => out.push_str(&segment),
                }
                *context.last_mut().unwrap() = Some(full);
            }
            'T' => {
                // Type variable; copy through to the terminating ';'.
                while i < chars.len() && chars[i] != ';' {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '<' => {
                out.push('<');
                context.push(None);
                i += 1;
            }
            '>' => {
                out.push('>');
                context.pop();
                if context.is_empty() {
                    context.push(None);
                }
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    if changed { Some(out) } else { None }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mapper(name: &str) -> Option<String> {
        match name {
            "a" => Some("net/minecraft/Foo".into()),
            "a$b" => Some("net/minecraft/Foo$Inner".into()),
            "c" => Some("net/minecraft/Bar".into()),
            _ => None,
        }
    }

    #[test]
    fn primitive_descriptors_unchanged() {
        assert_eq!(map_descriptor("I", &mapper), None);
        assert_eq!(map_descriptor("(IJ)V", &mapper), None);
        assert_eq!(map_descriptor("Lunmapped/Class;", &mapper), None);
    }

    #[test]
    fn maps_field_and_method_descriptors() {
        assert_eq!(
            map_descriptor("La;", &mapper).as_deref(),
            Some("Lnet/minecraft/Foo;")
        );
        assert_eq!(
            map_descriptor("[[La;", &mapper).as_deref(),
            Some("[[Lnet/minecraft/Foo;")
        );
        assert_eq!(
            map_descriptor("(ILa;Lc;)Lc;", &mapper).as_deref(),
            Some("(ILnet/minecraft/Foo;Lnet/minecraft/Bar;)Lnet/minecraft/Bar;")
        );
    }

    #[test]
    fn maps_generic_signatures() {
        assert_eq!(
            map_signature("Ljava/util/List<La;>;", &mapper).as_deref(),
            Some("Ljava/util/List<Lnet/minecraft/Foo;>;")
        );
        assert_eq!(
            map_signature("<T:Ljava/lang/Object;>(TT;La;)V", &mapper).as_deref(),
            Some("<T:Ljava/lang/Object;>(TT;Lnet/minecraft/Foo;)V")
        );
        assert_eq!(map_signature("Ljava/util/List<TT;>;", &mapper), None);
    }

    #[test]
    fn maps_inner_class_segments() {
        assert_eq!(
            map_signature("La.b;", &mapper).as_deref(),
            Some("Lnet/minecraft/Foo.Inner;")
        );
        assert_eq!(
            map_signature("La<Lc;>.b;", &mapper).as_deref(),
            Some("Lnet/minecraft/Foo<Lnet/minecraft/Bar;>.Inner;")
        );
    }
}
