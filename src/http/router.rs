//! A small radix-style path trie.
//!
//! Patterns are split into segments once at registration time. A segment is
//! either a static literal, a `:name` dynamic capture, or a `*name` trailing
//! wildcard. Lookup walks the tree one path segment at a time, preferring a
//! static child over a dynamic one, and a dynamic one over a wildcard,
//! matching the precedence the teacher's own trie uses.

use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
enum Pattern {
    Static(Arc<str>),
    Dynamic(Arc<str>),
    Wildcard(Arc<str>),
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn pattern_of(segment: &str) -> Pattern {
    if let Some(name) = segment.strip_prefix(':') {
        Pattern::Dynamic(Arc::from(name))
    } else if let Some(name) = segment.strip_prefix('*') {
        Pattern::Wildcard(Arc::from(name))
    } else {
        Pattern::Static(Arc::from(segment))
    }
}

pub struct Node<T> {
    pattern: Pattern,
    children: Vec<Node<T>>,
    route: Option<T>,
}

pub struct Router<T> {
    root: Vec<Node<T>>,
    index: Option<T>,
}

/// A single path parameter captured while matching a request path.
pub struct Binding<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

/// The outcome of a successful [`Router::visit`].
pub struct Matched<'a, T> {
    pub route: &'a T,
    pub params: SmallVec<[Binding<'a>; 4]>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self {
            root: Vec::new(),
            index: None,
        }
    }
}

impl<T> Router<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `route` at `pattern`, creating any missing intermediate
    /// segments. Re-registering the same pattern overwrites its route.
    pub fn insert(&mut self, pattern: &str, route: T) {
        let segments: Vec<&str> = split(pattern).collect();

        let Some((first, rest)) = segments.split_first() else {
            self.index = Some(route);
            return;
        };

        let mut wanted = pattern_of(first);
        let mut cursor = &mut self.root;
        let mut index = cursor
            .iter()
            .position(|node| node.pattern == wanted)
            .unwrap_or_else(|| {
                cursor.push(Node {
                    pattern: wanted.clone(),
                    children: Vec::new(),
                    route: None,
                });
                cursor.len() - 1
            });

        for segment in rest {
            cursor = &mut cursor[index].children;
            wanted = pattern_of(segment);
            index = cursor
                .iter()
                .position(|node| node.pattern == wanted)
                .unwrap_or_else(|| {
                    cursor.push(Node {
                        pattern: wanted.clone(),
                        children: Vec::new(),
                        route: None,
                    });
                    cursor.len() - 1
                });
        }

        cursor[index].route = Some(route);
    }

    /// Returns a mutable reference to the route stored at `pattern`,
    /// inserting `T::default()` first if the pattern has not been seen.
    pub fn entry(&mut self, pattern: &str) -> &mut T
    where
        T: Default,
    {
        let segments: Vec<&str> = split(pattern).collect();

        let Some((first, rest)) = segments.split_first() else {
            return self.index.get_or_insert_with(T::default);
        };

        let mut wanted = pattern_of(first);
        let mut cursor = &mut self.root;
        let mut index = cursor
            .iter()
            .position(|node| node.pattern == wanted)
            .unwrap_or_else(|| {
                cursor.push(Node {
                    pattern: wanted.clone(),
                    children: Vec::new(),
                    route: None,
                });
                cursor.len() - 1
            });

        for segment in rest {
            cursor = &mut cursor[index].children;
            wanted = pattern_of(segment);
            index = cursor
                .iter()
                .position(|node| node.pattern == wanted)
                .unwrap_or_else(|| {
                    cursor.push(Node {
                        pattern: wanted.clone(),
                        children: Vec::new(),
                        route: None,
                    });
                    cursor.len() - 1
                });
        }

        cursor[index].route.get_or_insert_with(T::default)
    }

    /// Matches `path` against the tree, returning the most specific route
    /// along with any captured dynamic/wildcard bindings.
    pub fn visit<'a>(&'a self, path: &'a str) -> Option<Matched<'a, T>> {
        let segments: Vec<&str> = split(path).collect();

        if segments.is_empty() {
            return self.index.as_ref().map(|route| Matched {
                route,
                params: SmallVec::new(),
            });
        }

        let mut params = SmallVec::new();
        visit(&self.root, &segments, &mut params).map(|route| Matched { route, params })
    }
}

fn visit<'a, 'c, T>(
    nodes: &'a [Node<T>],
    segments: &'c [&'a str],
    params: &mut SmallVec<[Binding<'a>; 4]>,
) -> Option<&'a T> {
    let (segment, rest) = segments.split_first()?;

    // Static match first.
    for node in nodes {
        if let Pattern::Static(literal) = &node.pattern {
            if &**literal == *segment {
                if rest.is_empty() {
                    if let Some(route) = &node.route {
                        return Some(route);
                    }
                }
                if let Some(route) = visit(&node.children, rest, params) {
                    return Some(route);
                }
            }
        }
    }

    // Then dynamic.
    for node in nodes {
        if let Pattern::Dynamic(name) = &node.pattern {
            let mark = params.len();
            params.push(Binding { name, value: segment });

            if rest.is_empty() {
                if let Some(route) = &node.route {
                    return Some(route);
                }
            }
            if let Some(route) = visit(&node.children, rest, params) {
                return Some(route);
            }

            params.truncate(mark);
        }
    }

    // Finally a trailing wildcard consumes everything remaining.
    for node in nodes {
        if let Pattern::Wildcard(name) = &node.pattern {
            if let Some(route) = &node.route {
                params.push(Binding { name, value: segment });
                return Some(route);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_static_before_dynamic() {
        let mut router = Router::new();
        router.insert("/data/contact", "collection");
        router.insert("/data/:feather", "dynamic");

        let matched = router.visit("/data/contact").unwrap();
        assert_eq!(*matched.route, "collection");
        assert!(matched.params.is_empty());
    }

    #[test]
    fn captures_dynamic_segments() {
        let mut router = Router::new();
        router.insert("/data/:feather/:id", "member");

        let matched = router.visit("/data/contact/42").unwrap();
        assert_eq!(*matched.route, "member");
        assert_eq!(matched.params[0].name, "feather");
        assert_eq!(matched.params[0].value, "contact");
        assert_eq!(matched.params[1].name, "id");
        assert_eq!(matched.params[1].value, "42");
    }

    #[test]
    fn wildcard_consumes_the_rest_of_the_path() {
        let mut router = Router::new();
        router.insert("/do/*query", "control");

        let matched = router.visit("/do/subscribe").unwrap();
        assert_eq!(*matched.route, "control");
        assert_eq!(matched.params[0].value, "subscribe");
    }

    #[test]
    fn unmatched_paths_return_none() {
        let mut router: Router<&str> = Router::new();
        router.insert("/feather/:name", "feather");

        assert!(router.visit("/unknown").is_none());
    }
}
