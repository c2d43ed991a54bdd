use kube::CustomResourceExt;
use workload_operator::crd::{
    Instance, Location, Network, NetworkBinding, NetworkContext, Subnet, SubnetClaim, Workload,
    WorkloadDeployment,
};

fn main() -> anyhow::Result<()> {
    let crds = [
        Workload::crd(),
        WorkloadDeployment::crd(),
        Instance::crd(),
        // consumed kinds, for development clusters
        Location::crd(),
        Network::crd(),
        NetworkBinding::crd(),
        NetworkContext::crd(),
        SubnetClaim::crd(),
        Subnet::crd(),
    ];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
