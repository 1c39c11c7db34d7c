pub(crate) mod bins;
pub(crate) mod chunk;
pub(crate) mod committed;
pub(crate) mod refill;
pub(crate) mod space;
pub(crate) mod stats;
pub(crate) mod sweep;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
