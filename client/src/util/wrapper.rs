/// Wrapper around a type `T` that can be used to implement helpers for
/// foreign types such as `Vec<Proposal>`.
///
/// # Examples
///
/// ```
/// use stakegov_client::Wrapper;
///
/// let value = Wrapper(vec![3, 1, 2]);
/// assert_eq!(value.0.len(), 3);
/// ```
pub struct Wrapper<T>(pub T);
