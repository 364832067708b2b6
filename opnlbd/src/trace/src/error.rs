pub trait TraceableError: std::fmt::Debug {
    fn metric_label(&self) -> String;
}
