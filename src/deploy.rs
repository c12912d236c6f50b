// Workload deployer. A boundary effector, not part of the orchestrator: it
// drops a static page under the state directory and starts a throwaway HTTP
// server inside the subnet's namespace through the driver. The server is
// detached and unsupervised.

use std::path::Path;

use crate::error::{Result, VpcError};
use crate::model::{SubnetRecord, VpcRecord};
use crate::net::NetworkDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkloadKind {
    Nginx,
    Python,
}

pub fn run(
    driver: &dyn NetworkDriver,
    state_dir: &Path,
    vpc: &VpcRecord,
    subnet: &SubnetRecord,
    kind: WorkloadKind,
    port: u16,
) -> Result<()> {
    match kind {
        WorkloadKind::Nginx => {
            let page = format!(
                "<!DOCTYPE html>\n<html>\n<head><title>vpcctl - {vpc}/{subnet}</title></head>\n\
                 <body>\n<h1>Hello from {vpc}/{subnet}</h1>\n\
                 <p>IP: {ip}</p>\n<p>Subnet: {cidr}</p>\n<p>Type: {kind}</p>\n</body>\n</html>\n",
                vpc = vpc.name,
                subnet = subnet.name,
                ip = subnet.endpoint,
                cidr = subnet.cidr,
                kind = subnet.kind.as_str(),
            );
            let page_path = state_dir.join(format!("{}-{}.html", vpc.name, subnet.name));
            std::fs::write(&page_path, page).map_err(VpcError::Io)?;

            driver.spawn_in_namespace(
                &subnet.namespace,
                &format!(
                    "python3 -m http.server {} --directory {}",
                    port,
                    state_dir.display()
                ),
            )?;
            tracing::info!(
                "workload serving {} at {}:{}",
                page_path.display(),
                subnet.endpoint,
                port
            );
        }
        WorkloadKind::Python => {
            driver.spawn_in_namespace(
                &subnet.namespace,
                &format!("python3 -m http.server {}", port),
            )?;
            tracing::info!("workload serving at {}:{}", subnet.endpoint, port);
        }
    }
    Ok(())
}
