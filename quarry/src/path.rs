//! Dotted path helpers shared by the cast pipeline, population and the memory driver.

use mongodb::bson::{Bson, Document};

pub(crate) fn is_operator(key: &str) -> bool {
    key.starts_with('$')
}

pub(crate) fn has_operators(document: &Document) -> bool {
    document.keys().any(|key| is_operator(key))
}

/// Positional (`$`, `$[]`, `$[id]`) or numeric segments address array elements.
pub(crate) fn is_element_segment(segment: &str) -> bool {
    segment.starts_with('$') || (!segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
}

pub fn get<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

pub fn set(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
        }
        Some((head, rest)) => {
            let entry = document
                .entry(head.to_owned())
                .or_insert_with(|| Bson::Document(Document::new()));

            match entry {
                Bson::Document(inner) => set(inner, rest, value),
                Bson::Array(items) => set_in_array(items, rest, value),
                other => {
                    let mut inner = Document::new();
                    set(&mut inner, rest, value);
                    *other = Bson::Document(inner);
                }
            }
        }
    }
}

fn set_in_array(items: &mut Vec<Bson>, path: &str, value: Bson) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    let Ok(index) = head.parse::<usize>() else {
        return;
    };

    while items.len() <= index {
        items.push(Bson::Null);
    }

    match rest {
        None => items[index] = value,
        Some(rest) => {
            if !matches!(items[index], Bson::Document(_)) {
                items[index] = Bson::Document(Document::new());
            }
            if let Bson::Document(inner) = &mut items[index] {
                set(inner, rest, value);
            }
        }
    }
}

pub fn remove(document: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => document.remove(path),
        Some((head, rest)) => match document.get_mut(head)? {
            Bson::Document(inner) => remove(inner, rest),
            _ => None,
        },
    }
}

/// True when `a` and `b` are the same path or one is a parent of the other.
pub(crate) fn overlaps(a: &str, b: &str) -> bool {
    fn is_prefix(parent: &str, child: &str) -> bool {
        child
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with('.'))
    }

    a == b || is_prefix(a, b) || is_prefix(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn get_walks_documents_and_arrays() {
        let document = doc! { "a": { "b": [ { "c": 1 }, { "c": 2 } ] } };

        assert_eq!(get(&document, "a.b.1.c"), Some(&Bson::Int32(2)));
        assert_eq!(get(&document, "a.x"), None);
    }

    #[test]
    fn set_creates_intermediate_documents() {
        let mut document = doc! { "a": 1 };
        set(&mut document, "b.c.d", Bson::Boolean(true));

        assert_eq!(document, doc! { "a": 1, "b": { "c": { "d": true } } });
    }

    #[test]
    fn overlap_is_segment_aware() {
        assert!(overlaps("name", "name.first"));
        assert!(!overlaps("name", "names"));
    }
}
