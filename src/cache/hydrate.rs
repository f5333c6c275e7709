use std::collections::HashMap;

/// Expands route-parameter templates into concrete pattern strings.
///
/// Every literal `:name` occurrence in each pattern is replaced with the
/// value bound to `name`. The input slice is never mutated; callers get a
/// fresh vector each time, so per-request hydration cannot leak into the
/// configured templates.
///
/// Parameters are applied in arbitrary order. If a parameter *value*
/// contains a substring of the form `:otherName` the result depends on that
/// order; templates and values are expected not to do this, and no
/// fixed-point re-hydration is attempted.
pub fn hydrate(patterns: &[String], params: &HashMap<String, String>) -> Vec<String> {
    let mut hydrated: Vec<String> = patterns.to_vec();
    for (name, value) in params {
        let token = format!(":{name}");
        for pattern in &mut hydrated {
            if pattern.contains(&token) {
                *pattern = pattern.replace(&token, value);
            }
        }
    }
    hydrated
}
