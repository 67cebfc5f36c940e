/// Return a shortened version of the function name.
#[macro_export]
macro_rules! short_function {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            core::any::type_name::<T>()
        }
        let name = type_name_of(f);

        // Find and cut the rest of the path
        match &name[..name.len() - 3].rfind(':') {
            Some(pos) => &name[pos + 1..name.len() - 3],
            None => &name[..name.len() - 3],
        }
    }};
}

#[cfg(test)]
mod tests {
    fn named_caller() -> &'static str {
        short_function!()
    }

    #[test]
    fn short_function_name() {
        assert_eq!(named_caller(), "named_caller");
    }
}
