//! Components for mapping between descriptor sources and lowered constructs

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Span {
    pub begin: usize,
    pub end: usize,
}

impl Span {
    pub fn new(begin: usize, end: usize) -> Self {
        Span { begin, end }
    }
}
