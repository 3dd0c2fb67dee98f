/** A macro that defines a function for an enum, calling the same function on all enum variants.

For example, the usage:

```ignore
enum_passthrough!(self, (cb_queue), Pipe, Socket;
    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError>
);
```

expands to:

```ignore
pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
    match self {
        Self::Pipe(x) => x.close(cb_queue),
        Self::Socket(x) => x.close(cb_queue),
    }
}
```
**/
macro_rules! enum_passthrough {
    ($self:ident, $args2:tt, $($variant:ident),+; $v:vis fn $name:ident $args:tt $(-> $($rv:tt)+)?) => {
        $v fn $name $args $(-> $($rv)+)? {
            match $self {
                $(
                Self::$variant(x) => x.$name $args2,
                )*
            }
        }
    };
}
