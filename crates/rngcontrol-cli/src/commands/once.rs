use rngcontrol_core::{ControlConfig, ExperimentRequest};

pub fn run(config: ControlConfig, xp_id: &str, user_id: &str) {
    if xp_id.trim().is_empty() {
        log::error!("--xp-id must not be empty");
        std::process::exit(2);
    }
    let rt = super::runtime();
    rt.block_on(async {
        let controller = super::start_controller(config).await;
        let handle = controller.handle();

        handle.trigger(ExperimentRequest::new(xp_id, user_id));
        tokio::select! {
            _ = handle.wait_idle_after(0) => {}
            _ = tokio::signal::ctrl_c() => log::info!("Interrupted, aborting run"),
        }

        let status = handle.status();
        controller.shutdown().await;
        log::info!("Done after {} run(s)", status.generation);
    });
}
