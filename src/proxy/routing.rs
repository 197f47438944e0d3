//! Specificity-based route matching for incoming HTTP requests.
//!
//! [`match_route`] scores each configured route against the request
//! path and method: exact segments score highest, parameterized segments
//! (`:param`) lower, wildcard prefixes (`/prefix/*`) and the catch-all
//! (`/*`) lowest. The highest-scoring route wins; ties go to the route
//! listed first.

use crate::config::model::Route;

#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn match_route(routes: &[Route], path: &str, method: &str) -> Option<usize> {
    let request_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut best_match: Option<usize> = None;
    let mut best_specificity: i32 = -1;

    for (idx, route) in routes.iter().enumerate() {
        if !method_matches(&route.methods, method) {
            continue;
        }

        let route_path = &route.path;

        if route_path == "/*" || route_path == "*" {
            if best_specificity < 0 {
                best_match = Some(idx);
                best_specificity = 0;
            }
            continue;
        }

        // "/uploads/*" matches "/uploads/anything/deep"
        if let Some(prefix) = route_path.strip_suffix("/*") {
            let prefix_segments: Vec<&str> = prefix.split('/').filter(|s| !s.is_empty()).collect();

            if request_segments.len() >= prefix_segments.len()
                && segments_match_exact(
                    &prefix_segments,
                    &request_segments[..prefix_segments.len()],
                )
            {
                let specificity = prefix_segments.len() as i32 * 10;
                if specificity > best_specificity {
                    best_match = Some(idx);
                    best_specificity = specificity;
                }
            }
            continue;
        }

        let route_segments: Vec<&str> = route_path.split('/').filter(|s| !s.is_empty()).collect();
        if route_segments.len() != request_segments.len() {
            continue;
        }

        let mut specificity: i32 = 0;
        let matched = route_segments
            .iter()
            .zip(request_segments.iter())
            .all(|(rs, qs)| {
                if rs.starts_with(':') {
                    specificity += 5;
                    true
                } else if rs == qs {
                    specificity += 10;
                    true
                } else {
                    false
                }
            });

        if matched && specificity > best_specificity {
            best_match = Some(idx);
            best_specificity = specificity;
        }
    }

    best_match
}

fn method_matches(methods: &[String], method: &str) -> bool {
    methods
        .iter()
        .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
}

fn segments_match_exact(route: &[&str], request: &[&str]) -> bool {
    route.iter().zip(request.iter()).all(|(r, q)| *r == *q)
}
