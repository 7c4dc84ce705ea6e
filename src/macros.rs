//! Convenience macros.

/// Declares a lazily registered allocation class as a static.
///
/// Registration happens on first use of the handle, mirroring
/// constructor-time registration without life-before-main:
///
/// ```
/// magalloc::define_class!(
///     static WIDGETS = magalloc::ClassConfig {
///         name: Some("widgets".to_string()),
///         size: 24,
///         zero_init: true,
///         ..Default::default()
///     };
/// );
///
/// let p = magalloc::allocate(*WIDGETS);
/// magalloc::release(*WIDGETS, p.as_ptr());
/// ```
#[macro_export]
macro_rules! define_class {
    ($vis:vis static $name:ident = $config:expr;) => {
        $vis static $name: ::std::sync::LazyLock<$crate::Class> =
            ::std::sync::LazyLock::new(|| $crate::Class::register($config));
    };
}
