#[cfg(test)]
pub(crate) mod test {
    use env_logger::*;
    use log::LevelFilter;

    pub(crate) fn init() {
        let _ = Builder::new().filter_level(LevelFilter::Debug).is_test(true).try_init();
    }
}
