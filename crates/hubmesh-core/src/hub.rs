/// A logical channel type whose clients share one local delivery service.
///
/// `NAME` is the discriminator stamped into every envelope published for the
/// hub and used by receiving nodes to look up their own delivery service, so
/// it must be identical on every node of the cluster and stable across
/// builds.
pub trait Hub: Send + Sync + 'static {
    const NAME: &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChatHub;

    impl Hub for ChatHub {
        const NAME: &'static str = "chat";
    }

    fn name_of<H: Hub>() -> &'static str {
        H::NAME
    }

    #[test]
    fn name_is_reachable_generically() {
        assert_eq!(name_of::<ChatHub>(), "chat");
    }
}
