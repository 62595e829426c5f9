use mediarepo_service::config::Config;
use mediarepo_service::services::SharedServices;
use mediarepo_service::types::MediaId;
use mediarepo_test as test;

pub use test::Fakes;

/// Setup tests and create the services to test, backed by fresh in-memory fakes.
///
/// The `update_config` closure can modify any default configuration if needed before the
/// services are created.
pub fn setup_services(update_config: impl FnOnce(&mut Config)) -> (SharedServices, Fakes) {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let fakes = Fakes::new();
    let handle = tokio::runtime::Handle::current();
    let services = SharedServices::new(config, fakes.collaborators(), handle).unwrap();

    (services, fakes)
}

pub fn remote_media(media_id: &str) -> MediaId {
    MediaId::new("remote.example.org", media_id)
}

pub fn local_media(media_id: &str) -> MediaId {
    MediaId::new("local.example.org", media_id)
}
