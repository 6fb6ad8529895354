//! Lookup helpers over collections of entities

/// Return the first item matching `predicate`
pub fn find<I, P>(items: I, mut predicate: P) -> Option<I::Item>
where
    I: IntoIterator,
    P: FnMut(&I::Item) -> bool,
{
    items.into_iter().find(|item| predicate(item))
}

/// Return the first item whose extracted key equals `value`
pub fn get<I, K, F>(items: I, key: F, value: &K) -> Option<I::Item>
where
    I: IntoIterator,
    K: PartialEq,
    F: Fn(&I::Item) -> K,
{
    items.into_iter().find(|item| key(item) == *value)
}
