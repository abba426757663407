use herald::*;
use std::fmt;

/// Fixture message usable in every pipeline category.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestMessage {
    pub kind: TestKind,
    pub tag: String,
}

impl TestMessage {
    pub fn new(kind: TestKind, tag: impl Into<String>) -> Self {
        Self {
            kind,
            tag: tag.into(),
        }
    }

    pub fn alpha(tag: impl Into<String>) -> Self {
        Self::new(TestKind::Alpha, tag)
    }

    pub fn beta(tag: impl Into<String>) -> Self {
        Self::new(TestKind::Beta, tag)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TestKind {
    Alpha,
    Beta,
}

impl MessageKind for TestKind {
    fn all() -> &'static [Self] {
        &[TestKind::Alpha, TestKind::Beta]
    }

    fn as_str(&self) -> &'static str {
        match self {
            TestKind::Alpha => "alpha",
            TestKind::Beta => "beta",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message for TestMessage {
    type Kind = TestKind;

    fn kind(&self) -> TestKind {
        self.kind
    }
}

/// Requests answer with `"{handler}:{tag}"`.
impl RequestMessage for TestMessage {
    type Response = String;
}
