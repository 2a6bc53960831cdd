use std::collections::HashMap;

use crate::http::{Context, Method, Outcome};

/// Compile-time ceiling for captures and query pairs; the configured limits
/// clamp below this.
pub const CAPTURES_MAX: usize = 8;
pub const QUERIES_MAX: usize = 8;

pub type Handler = fn(Context) -> Outcome;

/// Small set of methods registered on one route, used to build `Allow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodSet(u16);

impl MethodSet {
    pub fn insert(&mut self, m: Method) {
        self.0 |= 1 << m as u16;
    }

    pub fn contains(&self, m: Method) -> bool {
        self.0 & (1 << m as u16) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Method> + '_ {
        Method::ALL.iter().copied().filter(|m| self.contains(*m))
    }

    /// `Allow` header value, e.g. `GET, HEAD`.
    pub fn allow_header(&self) -> String {
        self.iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Clone)]
struct RouteNode {
    path: String,
    handlers: HashMap<Method, Handler>,
    children: Vec<RouteNode>,
    is_param: bool,
    param_name: Option<String>,
}

impl RouteNode {
    fn new(path: String) -> Self {
        Self {
            path,
            handlers: HashMap::new(),
            children: Vec::new(),
            is_param: false,
            param_name: None,
        }
    }

    fn method_set(&self) -> MethodSet {
        let mut set = MethodSet::default();
        for m in self.handlers.keys() {
            set.insert(*m);
        }
        set
    }
}

/// Result of matching one request against the route table.
pub enum Lookup<'r, 'p> {
    /// No route covers this path.
    NotFound,
    /// A route covers the path, but not with this method. The set carries the
    /// methods that would have matched.
    MethodNotAllowed(MethodSet),
    Found {
        handler: &'r Handler,
        captures: [(&'p str, &'p str); CAPTURES_MAX],
        capture_count: u8,
    },
}

#[derive(Clone)]
pub struct Router {
    root: RouteNode,
}

impl Router {
    pub fn new() -> Self {
        Self {
            root: RouteNode::new(String::new()),
        }
    }

    pub fn add(&mut self, method: Method, path: &str, handler: Handler) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = &mut self.root;

        for segment in segments {
            let is_param = segment.starts_with(':');
            let param_name = if is_param {
                Some(segment[1..].to_string())
            } else {
                None
            };
            let segment_path = if is_param {
                String::new()
            } else {
                segment.to_string()
            };

            let mut found_idx = None;
            for (i, child) in current.children.iter().enumerate() {
                if child.is_param == is_param && (is_param || child.path == segment_path) {
                    found_idx = Some(i);
                    break;
                }
            }

            if let Some(idx) = found_idx {
                current = &mut current.children[idx];
            } else {
                let mut node = RouteNode::new(segment_path);
                node.is_param = is_param;
                node.param_name = param_name;
                current.children.push(node);
                current = current.children.last_mut().unwrap();
            }
        }

        current.handlers.insert(method, handler);
    }

    /// Match `(method, path)`. `capture_limit` caps how many captures are
    /// stored (never above [`CAPTURES_MAX`]).
    pub fn lookup<'r: 'p, 'p>(
        &'r self,
        method: Method,
        path: &'p str,
        capture_limit: usize,
    ) -> Lookup<'r, 'p> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut captures = [("", ""); CAPTURES_MAX];
        let mut count: u8 = 0;
        let mut allowed = MethodSet::default();
        let limit = capture_limit.min(CAPTURES_MAX);

        let handler = self.descend(
            &self.root,
            method,
            &segments,
            0,
            &mut captures,
            &mut count,
            limit,
            &mut allowed,
        );

        match handler {
            Some(h) => Lookup::Found {
                handler: h,
                captures,
                capture_count: count,
            },
            None if !allowed.is_empty() => Lookup::MethodNotAllowed(allowed),
            None => Lookup::NotFound,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn descend<'r: 'p, 'p>(
        &'r self,
        node: &'r RouteNode,
        method: Method,
        segments: &[&'p str],
        depth: usize,
        captures: &mut [(&'p str, &'p str); CAPTURES_MAX],
        count: &mut u8,
        limit: usize,
        allowed: &mut MethodSet,
    ) -> Option<&'r Handler> {
        if depth == segments.len() {
            if let Some(h) = node.handlers.get(&method) {
                return Some(h);
            }
            let set = node.method_set();
            if !set.is_empty() {
                *allowed = set;
            }
            return None;
        }

        let segment = segments[depth];

        // Exact children win over params.
        for child in &node.children {
            if !child.is_param && child.path == segment {
                if let Some(h) =
                    self.descend(child, method, segments, depth + 1, captures, count, limit, allowed)
                {
                    return Some(h);
                }
            }
        }

        for child in &node.children {
            if child.is_param {
                let old_count = *count;
                if (*count as usize) < limit {
                    if let Some(ref name) = child.param_name {
                        captures[*count as usize] = (name.as_str(), segment);
                        *count += 1;
                    }
                }
                if let Some(h) =
                    self.descend(child, method, segments, depth + 1, captures, count, limit, allowed)
                {
                    return Some(h);
                }
                *count = old_count; // backtrack
            }
        }

        None
    }

    pub fn get(&mut self, path: &str, handler: Handler) {
        self.add(Method::Get, path, handler);
    }
    pub fn post(&mut self, path: &str, handler: Handler) {
        self.add(Method::Post, path, handler);
    }
    pub fn put(&mut self, path: &str, handler: Handler) {
        self.add(Method::Put, path, handler);
    }
    pub fn delete(&mut self, path: &str, handler: Handler) {
        self.add(Method::Delete, path, handler);
    }
    pub fn patch(&mut self, path: &str, handler: Handler) {
        self.add(Method::Patch, path, handler);
    }
    pub fn head(&mut self, path: &str, handler: Handler) {
        self.add(Method::Head, path, handler);
    }
    pub fn options(&mut self, path: &str, handler: Handler) {
        self.add(Method::Options, path, handler);
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a raw query string into at most `limit` pairs. Pairs beyond the
/// limit are dropped; keys without `=` get an empty value.
pub fn parse_queries<'a>(
    raw: &'a str,
    out: &mut [(&'a str, &'a str); QUERIES_MAX],
    limit: usize,
) -> u8 {
    let mut count: u8 = 0;
    let limit = limit.min(QUERIES_MAX);
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        if (count as usize) >= limit {
            break;
        }
        let (k, v) = match pair.find('=') {
            Some(idx) => (&pair[..idx], &pair[idx + 1..]),
            None => (pair, ""),
        };
        out[count as usize] = (k, v);
        count += 1;
    }
    count
}
