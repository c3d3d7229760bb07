use crate::config::ProxmoxConfig;
use crate::proxmox::ProxmoxClient;
use wiremock::MockServer;

pub const NODE: &str = "pve";
pub const VMID: u32 = 2000;

pub fn proxmox_config() -> ProxmoxConfig {
    ProxmoxConfig {
        host: "127.0.0.1".to_string(),
        port: 8006,
        token_id: "bot@pve!status".to_string(),
        token_secret: Some("secret".to_string()),
        token_secret_env: "PVEBOT_TEST_SECRET_UNSET".to_string(),
        node: NODE.to_string(),
        container_id: Some(VMID),
        display_name: "Cartofia".to_string(),
        verify_tls: false,
        timeout_secs: 2,
    }
}

pub fn client_for(server: &MockServer) -> ProxmoxClient {
    ProxmoxClient::with_base_url(
        &proxmox_config(),
        "secret",
        format!("{}/api2/json", server.uri()),
    )
    .expect("client for mock server")
}
