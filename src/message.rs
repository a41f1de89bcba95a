/// A payload tagged with a caller-assigned tracking id.
///
/// The engine never reads or changes the id; it only forwards it so that
/// consumers can correlate outputs with inputs after stages reorder them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message<T> {
    pub id: i64,
    pub payload: T,
}

impl<T> Message<T> {
    /// Create a new message
    pub fn new(id: i64, payload: T) -> Self {
        Self { id, payload }
    }

    /// Build a new message with the same id and a transformed payload
    pub fn map<U, F>(self, f: F) -> Message<U>
    where
        F: FnOnce(T) -> U,
    {
        Message {
            id: self.id,
            payload: f(self.payload),
        }
    }
}
