use std::collections::HashMap;

/// Latest-wins guard for result views.
///
/// The shell stamps each fetch for a view with a monotonically increasing
/// token. If a slow request arrives carrying a token lower than one already
/// seen for that view, a newer fetch has superseded it and the reply must
/// not overwrite fresher state. Requests without a token (manual refresh)
/// always pass.
#[derive(Debug, Default)]
pub struct ViewGuards {
    latest: HashMap<&'static str, u64>,
}

impl ViewGuards {
    /// Records `token` for `view` and reports whether the request is still
    /// current. Re-sending the highest token is allowed (retry of the
    /// latest fetch).
    pub fn admit(&mut self, view: &'static str, token: Option<u64>) -> bool {
        let Some(token) = token else {
            return true;
        };
        match self.latest.get(view).copied() {
            Some(latest) if token < latest => false,
            _ => {
                self.latest.insert(view, token);
                true
            }
        }
    }
}
