/// The opaque, already-authenticated caller token handed to every ledger
/// operation. `None` means the request carried no session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Caller(Option<String>);

impl Caller {
    pub fn authenticated(external_id: impl Into<String>) -> Self {
        Self(Some(external_id.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }

    /// The identity provider subject, if the caller is signed in.
    /// Blank tokens count as absent.
    pub fn external_id(&self) -> Option<&str> {
        self.0.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
}

impl From<Option<String>> for Caller {
    fn from(token: Option<String>) -> Self {
        Self(token)
    }
}
