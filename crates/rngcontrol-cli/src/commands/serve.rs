use rngcontrol_core::ControlConfig;

pub fn run(config: ControlConfig, host: &str, port: u16) {
    let rt = super::runtime();
    rt.block_on(async {
        let controller = super::start_controller(config).await;

        let shutdown = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => log::info!("Interrupted, shutting down"),
                Err(e) => log::error!("Could not listen for Ctrl+C: {e}"),
            }
        };
        let served =
            rngcontrol_server::run_server(controller.handle(), host, port, shutdown).await;

        controller.shutdown().await;
        if let Err(e) = served {
            log::error!("Server on {host}:{port} failed: {e}");
            std::process::exit(1);
        }
    });
}
