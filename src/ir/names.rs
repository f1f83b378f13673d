use super::VName;

/// Hands out fresh variable names for one lowering session.
///
/// Every session owns its own counter, so lowering the same descriptor twice produces identical
/// instruction streams.
#[derive(Clone, Default, Debug)]
pub struct NameSource {
    counter: usize,
}

impl NameSource {
    pub fn new() -> Self {
        NameSource { counter: 0 }
    }

    pub fn fresh(&mut self, base: &str) -> VName {
        let name = VName::new(&format!("{}_{}", base, self.counter));
        self.counter += 1;
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_names_are_distinct() {
        let mut names = NameSource::new();
        let a = names.fresh("ltid");
        let b = names.fresh("ltid");
        assert_ne!(a, b, "two fresh names collide");
        assert_eq!(a.as_str(), "ltid_0");
        assert_eq!(b.as_str(), "ltid_1");
    }

    #[test]
    fn sessions_do_not_share_counters() {
        let mut first = NameSource::new();
        first.fresh("x");
        first.fresh("x");
        let mut second = NameSource::new();
        assert_eq!(
            second.fresh("x").as_str(),
            "x_0",
            "a new session continued an old counter"
        );
    }
}
