use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!(
        "{}",
        serde_yaml::to_string(&example_operator::resources::examples::Example::crd())?
    );
    Ok(())
}
