use kube::CustomResourceExt;
use rustrial_k8s_alb_controller_apis::LoadBalancerConfig;
use serde_yaml;

pub fn main() {
    println!(
        "{}",
        serde_yaml::to_string(&LoadBalancerConfig::crd()).unwrap()
    );
}
