use kube::ResourceExt;

pub trait MonitorResourceExt: ResourceExt {
    /// Display name for logs and event messages. Namespaced objects render as
    /// `namespace/name`, cluster-scoped ones as the bare name.
    fn display_name(&self) -> String;

    fn annotation(&self, key: &str) -> Option<&String>;

    fn has_annotation(&self, key: &str) -> bool;
}

impl<K: ResourceExt> MonitorResourceExt for K {
    fn display_name(&self) -> String {
        match self.namespace() {
            Some(namespace) => format!("{}/{}", namespace, self.name_any()),
            None => self.name_any(),
        }
    }

    fn annotation(&self, key: &str) -> Option<&String> {
        self.meta().annotations.as_ref()?.get(key)
    }

    fn has_annotation(&self, key: &str) -> bool {
        self.annotation(key).is_some()
    }
}
